// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Constant-rate work queue.
//!
//! Registering a large account fleet in one burst trips DoS protection on
//! external proxies; the pool drains registrations through this queue at
//! a configured inter-arrival instead.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Queue that hands one item to `handler` every `rate` at most.
pub struct ThrottledQueue<T: Send + 'static> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> ThrottledQueue<T> {
    pub fn new(rate: Duration, handler: impl Fn(T) + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        tokio::spawn(async move {
            let mut ticker = interval(rate.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match rx.recv().await {
                    Some(item) => handler(item),
                    None => {
                        debug!("throttled queue drained and closed");
                        return;
                    }
                }
            }
        });
        Self { tx }
    }

    /// Enqueues an item; it is handled once the rate allows.
    pub fn enqueue(&self, item: T) {
        let _ = self.tx.send(item);
    }
}
