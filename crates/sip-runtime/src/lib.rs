// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cooperative scheduling primitives.
//!
//! All core mutations (fork progression, registrar updates, nonce
//! bookkeeping) happen on one event loop. Work that must block, such as a
//! credential fetch or an external store command, runs off-loop and posts
//! its continuation back through [`Runtime::post_to_loop`], the only
//! thread-safe entry point.
//!
//! Contexts suspended on off-loop work carry a [`CancellationToken`] so a
//! CANCEL or shutdown can short-circuit the continuation: the posted
//! closure checks the token and returns without emitting anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle for posting work onto the owning event loop.
#[derive(Clone)]
pub struct Runtime {
    tx: mpsc::UnboundedSender<Job>,
}

impl Runtime {
    /// Creates a runtime handle and the loop that drains it.
    pub fn new() -> (Self, EventLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventLoop { rx })
    }

    /// Enqueues a closure for execution on the loop.
    ///
    /// Fails only when the loop has shut down.
    pub fn post_to_loop(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| anyhow!("event loop is gone"))
    }

    /// Runs blocking `work` on a worker thread, then posts `done` with its
    /// result back onto the loop. If `token` is cancelled before the result
    /// arrives, `done` is never invoked.
    pub fn run_off_loop<T, W, D>(&self, token: CancellationToken, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = work();
            if token.is_cancelled() {
                debug!("off-loop result dropped, context cancelled");
                return;
            }
            let _ = this.post_to_loop(move || {
                if !token.is_cancelled() {
                    done(result);
                }
            });
        });
    }
}

/// The single consumer of posted jobs.
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl EventLoop {
    /// Drains jobs until every [`Runtime`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
    }

    /// Runs at most one pending job. Returns false when the queue was empty.
    ///
    /// Useful in tests to step the loop deterministically.
    pub fn step(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }

    /// Runs jobs until the queue is momentarily empty, returning the count.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.step() {
            n += 1;
        }
        n
    }
}

/// Shared flag marking a suspended context as no longer interested.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
