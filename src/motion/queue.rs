// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The bounded queue between a stream's detector and its event recorder.
//!
//! Single producer, single consumer, guarded by a mutex and condition
//! variable. On overflow the *oldest* pending event is dropped, so the
//! consumer always sees the most recent state transitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

/// Queue capacity; oldest events are dropped beyond this.
pub const MAX_MOTION_EVENT_QUEUE: usize = 64;

/// A motion state transition. Transient; not persisted directly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionEvent {
    /// Epoch seconds.
    pub timestamp: i64,

    /// `true` for begin, `false` for end.
    pub active: bool,

    pub confidence: f64,
}

pub struct MotionEventQueue {
    inner: Mutex<VecDeque<MotionEvent>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl MotionEventQueue {
    pub fn new() -> Self {
        MotionEventQueue {
            inner: Mutex::new(VecDeque::with_capacity(MAX_MOTION_EVENT_QUEUE)),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Appends an event, dropping the oldest pending one on overflow.
    pub fn push(&self, ev: MotionEvent) {
        let mut q = self.inner.lock().unwrap();
        if q.len() == MAX_MOTION_EVENT_QUEUE {
            let dropped = q.pop_front();
            warn!("motion event queue full; dropped {dropped:?}");
        }
        q.push_back(ev);
        drop(q);
        self.condvar.notify_one();
    }

    /// Blocks up to `timeout` for the next event. `None` on timeout or
    /// shutdown.
    pub fn pop(&self, timeout: Duration) -> Option<MotionEvent> {
        let q = self.inner.lock().unwrap();
        let (mut q, _) = self
            .condvar
            .wait_timeout_while(q, timeout, |q| {
                q.is_empty() && !self.shutdown.load(Ordering::SeqCst)
            })
            .unwrap();
        q.pop_front()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MotionEventQueue {
    fn default() -> Self {
        Self::new()
    }
}
