// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `WriteQueue`: a bounded ring of ready-to-send packets (§4.5). Push is
//! synchronous and fails with [`QueueFull`] once the ring is at capacity
//! rather than applying backpressure to the pusher; a dedicated writer task
//! drains it asynchronously until every sender is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::{bail, Error, ErrorInt};

/// Default write-side capacity (outbound media + RTCP), per §4.5.
pub const DEFAULT_WRITE_CAPACITY: usize = 256;
/// Default read-side capacity (buffered inbound RTCP receiver reports only).
pub const DEFAULT_READ_CAPACITY: usize = 8;

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    notify: Notify,
    senders: std::sync::atomic::AtomicUsize,
}

struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// The producer half; cheaply cloneable so both user code and a periodic
/// RTCP task can hold one.
pub struct WriteQueueSender<T> {
    shared: Arc<Shared<T>>,
}

/// The single consumer half, owned by the writer task.
pub struct WriteQueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a linked sender/receiver pair backed by a ring of `capacity`
/// slots. `capacity` must be a power of two, matching the ring invariant
/// (§4.5); violating it is a programmer error, not a runtime condition, so
/// this asserts rather than returning `Result`.
pub fn bounded<T>(capacity: usize) -> (WriteQueueSender<T>, WriteQueueReceiver<T>) {
    assert!(capacity.is_power_of_two(), "WriteQueue capacity must be a power of two, got {}", capacity);
    let shared = Arc::new(Shared {
        ring: Mutex::new(Ring {
            items: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }),
        notify: Notify::new(),
        senders: std::sync::atomic::AtomicUsize::new(1),
    });
    (
        WriteQueueSender {
            shared: shared.clone(),
        },
        WriteQueueReceiver { shared },
    )
}

impl<T> WriteQueueSender<T> {
    /// Pushes `item` onto the ring, failing with `ErrorKind::ResourceBusy`
    /// (`QueueFull`) if the ring is already at capacity; never blocks.
    pub fn push(&self, item: T) -> Result<(), Error> {
        let mut ring = self.shared.ring.lock().unwrap();
        if ring.items.len() >= ring.capacity {
            bail!(ErrorInt::QueueFull { capacity: ring.capacity });
        }
        ring.items.push_back(item);
        drop(ring);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.lock().unwrap().capacity
    }
}

impl<T> Clone for WriteQueueSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for WriteQueueSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
            self.shared.ring.lock().unwrap().closed = true;
            self.shared.notify.notify_one();
        }
    }
}

impl<T> WriteQueueReceiver<T> {
    /// Pops the next item, waiting if the ring is empty; returns `None` once
    /// every sender has been dropped and the ring has drained, matching the
    /// "drains the queue until the channel closes" consumer contract (§4.5).
    pub async fn pop(&mut self) -> Option<T> {
        loop {
            {
                let mut ring = self.shared.ring.lock().unwrap();
                if let Some(item) = ring.items.pop_front() {
                    return Some(item);
                }
                if ring.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.ring.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_capacity() {
        let _ = bounded::<u8>(7);
    }

    #[test]
    fn push_fails_once_full() {
        let (tx, _rx) = bounded::<u8>(2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert!(tx.push(3).is_err());
    }

    #[tokio::test]
    async fn pop_waits_for_push_then_drains() {
        let (tx, mut rx) = bounded::<u8>(8);
        tx.push(42).unwrap();
        assert_eq!(rx.pop().await, Some(42));
    }

    #[tokio::test]
    async fn pop_returns_none_after_all_senders_dropped() {
        let (tx, mut rx) = bounded::<u8>(8);
        drop(tx);
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn clone_keeps_queue_open_until_both_dropped() {
        let (tx, mut rx) = bounded::<u8>(8);
        let tx2 = tx.clone();
        drop(tx);
        tx2.push(7).unwrap();
        assert_eq!(rx.pop().await, Some(7));
        drop(tx2);
        assert_eq!(rx.pop().await, None);
    }
}
