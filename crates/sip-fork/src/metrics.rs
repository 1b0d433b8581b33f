// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fork lifecycle counters.
///
/// `finish` never exceeds `start`; once every context has finalised the
/// two are equal.
#[derive(Debug, Clone, Default)]
pub struct ForkCounters {
    inner: Arc<CounterData>,
}

#[derive(Debug, Default)]
struct CounterData {
    start: AtomicU64,
    finish: AtomicU64,
}

impl ForkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.inner.start.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finish(&self) {
        self.inner.finish.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start(&self) -> u64 {
        self.inner.start.load(Ordering::Relaxed)
    }

    pub fn finish(&self) -> u64 {
        self.inner.finish.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_between_clones() {
        let counters = ForkCounters::new();
        let clone = counters.clone();
        counters.record_start();
        clone.record_finish();
        assert_eq!(counters.start(), 1);
        assert_eq!(counters.finish(), 1);
    }
}
