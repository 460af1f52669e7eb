// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`DistributorRegistry`] (§2/§5): the cross-connection map from a track's
//! control URL to its [`super::distributor::StreamDistributor`], so a PLAY
//! session's SETUP on one connection can subscribe to a track a RECORD
//! session on a *different* connection is publishing. `ServerConnection`
//! owns one of these per listening server (not per connection) and hands a
//! clone to every `ServerSession` it creates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::distributor::StreamDistributor;

/// Cheaply cloneable; every clone shares the same underlying map.
#[derive(Clone, Default)]
pub struct DistributorRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<StreamDistributor>>>>>,
}

impl DistributorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `control`'s distributor, creating an empty one if this is the
    /// first session (publisher or reader) to touch that track.
    pub fn get_or_create(&self, control: &str) -> Arc<Mutex<StreamDistributor>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(control.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(StreamDistributor::new())))
            .clone()
    }

    /// Drops `control`'s entry once its publisher is gone; readers that
    /// already hold a clone of the `Arc` keep it (and just stop seeing new
    /// packets), a later SETUP against the same control starts fresh.
    pub fn remove(&self, control: &str) {
        self.inner.lock().unwrap().remove(control);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_control_returns_the_same_distributor() {
        let reg = DistributorRegistry::new();
        let a = reg.get_or_create("/cam/trackID=0");
        let b = reg.get_or_create("/cam/trackID=0");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_controls_get_different_distributors() {
        let reg = DistributorRegistry::new();
        let a = reg.get_or_create("/cam/trackID=0");
        let b = reg.get_or_create("/cam/trackID=1");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_lets_a_later_setup_start_fresh() {
        let reg = DistributorRegistry::new();
        let a = reg.get_or_create("/cam/trackID=0");
        reg.remove("/cam/trackID=0");
        let b = reg.get_or_create("/cam/trackID=0");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
