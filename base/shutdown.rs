// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Graceful-shutdown signalling.
//!
//! Each supervised component gets a `Sender`/`Receiver` pair; dropping the
//! sender requests shutdown. Receivers are cheap clones that can poll
//! (`check`, once per ingest-loop iteration), block (`wait_for`, the
//! detection loop's pacing sleep), or await (`future`, so a blocked RTSP
//! read wakes immediately instead of riding out its timeout).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Shared {
    requested: AtomicBool,

    /// Wakers parked by pending [`ReceiverFuture`]s, drained on request.
    wakers: Mutex<Vec<Waker>>,

    condvar: Condvar,
}

impl Shared {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // Drain with the lock held: a future registering concurrently either
        // lands in the vector before the drain or re-reads `requested` under
        // the same lock, so nobody sleeps through the signal.
        let mut wakers = self.wakers.lock().unwrap();
        for w in wakers.drain(..) {
            w.wake();
        }
        self.condvar.notify_all();
    }
}

/// Requests shutdown when dropped.
pub struct Sender(Arc<Shared>);

impl Drop for Sender {
    fn drop(&mut self) {
        self.0.request();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Shared>);

impl Receiver {
    /// Nonblocking; `Err` once shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.requested.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks up to `timeout`; `Ok` means the timeout elapsed without a
    /// shutdown request, so this doubles as an interruptible sleep.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let wakers = self.0.wakers.lock().unwrap();
        let (_wakers, result) = self
            .0
            .condvar
            .wait_timeout_while(wakers, timeout, |_| {
                !self.0.requested.load(Ordering::SeqCst)
            })
            .unwrap();
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    /// An owned (`'static`) future resolving when shutdown is requested;
    /// suitable for handing to a spawned task.
    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture(self.0.clone())
    }
}

pub struct ReceiverFuture(Arc<Shared>);

impl Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.requested.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        let mut wakers = self.0.wakers.lock().unwrap();
        // Re-check under the lock; see `Shared::request`.
        if self.0.requested.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        let new = cx.waker();
        if !wakers.iter().any(|w| w.will_wake(new)) {
            wakers.push(new.clone());
        }
        Poll::Pending
    }
}

/// Returns a connected pair. Dropping the `Sender` requests shutdown; there
/// is no way to request it while keeping the sender alive.
pub fn channel() -> (Sender, Receiver) {
    let shared = Arc::new(Shared {
        requested: AtomicBool::new(false),
        wakers: Mutex::new(Vec::new()),
        condvar: Condvar::new(),
    });
    (Sender(shared.clone()), Receiver(shared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::task::{Context, Poll};

    #[test]
    fn check_flips_on_drop() {
        let (tx, rx) = channel();
        let rx2 = rx.clone();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
        // Every clone observes the request.
        rx2.check().unwrap_err();
    }

    #[test]
    fn wait_for_is_an_interruptible_sleep() {
        let (tx, rx) = channel();
        // Timing out without a request is the Ok case.
        rx.wait_for(Duration::from_millis(1)).unwrap();

        let waiter = std::thread::spawn(move || rx.wait_for(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(10));
        drop(tx);
        waiter.join().unwrap().unwrap_err();
    }

    #[test]
    fn wait_for_after_request_returns_immediately() {
        let (tx, rx) = channel();
        drop(tx);
        rx.wait_for(Duration::from_secs(60)).unwrap_err();
    }

    #[test]
    fn future_resolves_on_drop() {
        let (tx, rx) = channel();
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut f = rx.future();
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        // Polling again must not grow the parked-waker list.
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        assert_eq!(rx.0.wakers.lock().unwrap().len(), 1);
        drop(tx);
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Ready(()));
        assert!(rx.0.wakers.lock().unwrap().is_empty());
    }
}
