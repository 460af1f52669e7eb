#![no_main]

use libfuzzer_sys::fuzz_target;
use rtsp_core::message::MessageFramer;
use tokio::io::AsyncWriteExt;

// Feeds arbitrary bytes to `MessageFramer::read_message` over a duplex pipe
// and reads messages off it until the framer errors or the input is
// exhausted. Only crashes/panics/hangs are interesting here; parse results
// aren't checked against anything.
fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    rt.block_on(async {
        let (mut writer, reader) = tokio::io::duplex(data.len().max(1) + 64);
        let write_all = data.to_vec();
        let write_task = tokio::spawn(async move {
            let _ = writer.write_all(&write_all).await;
            drop(writer);
        });

        let mut framer = MessageFramer::new(reader);
        loop {
            match framer.read_message().await {
                Ok(_msg) => continue,
                Err(_e) => break,
            }
        }
        let _ = write_task.await;
    });
});
