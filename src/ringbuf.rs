// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream bounded packet buffers sharing a process-wide byte pool.
//!
//! Each buffer holds the most recent `capacity` seconds of video for motion
//! pre-roll. The pool caps total memory across all streams; when it runs
//! dry, a stream over its fair share evicts its own oldest packets rather
//! than growing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::Error;
use tracing::debug;

use crate::stream::Packet;

/// Default process-wide pool: 50 MB.
pub const DEFAULT_POOL_BYTES: usize = 50 << 20;

/// The shared byte budget. Streams register so the fair share
/// (`capacity / streams`) tracks how many buffers exist.
pub struct PoolBudget {
    capacity: usize,
    used: AtomicUsize,
    streams: AtomicUsize,
}

impl PoolBudget {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(PoolBudget {
            capacity,
            used: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes one stream may hold before the pool considers it greedy.
    fn fair_share(&self) -> usize {
        self.capacity / self.streams.load(Ordering::Relaxed).max(1)
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = used.checked_add(bytes) else {
                return false;
            };
            if next > self.capacity {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(cur) => used = cur,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Counters returned by [`PacketRingBuffer::stats`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferStats {
    pub count: usize,
    pub bytes: usize,
    pub duration: Duration,
}

/// A bounded FIFO of packets, evicting oldest on overflow.
pub struct PacketRingBuffer {
    label: String,
    pool: Arc<PoolBudget>,

    /// Logical capacity: packets older than this relative to the newest
    /// arrival are evicted.
    capacity: Duration,

    entries: VecDeque<Packet>,
    bytes: usize,
}

impl PacketRingBuffer {
    pub fn new(label: String, pool: Arc<PoolBudget>, capacity: Duration) -> Self {
        pool.streams.fetch_add(1, Ordering::Relaxed);
        PacketRingBuffer {
            label,
            pool,
            capacity,
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(p) = self.entries.pop_front() {
            self.bytes -= p.len();
            self.pool.release(p.len());
        }
    }

    /// Appends a packet, evicting whatever the time window or byte budget
    /// demands. The packet is dropped entirely only if it alone exceeds the
    /// stream's fair share of the pool.
    pub fn push(&mut self, pkt: Packet) {
        let len = pkt.len();

        // Time window, measured against the newest arrival.
        while let Some(front) = self.entries.front() {
            if pkt.arrival.saturating_sub(front.arrival) > self.capacity {
                self.evict_oldest();
            } else {
                break;
            }
        }

        let fair_share = self.pool.fair_share();
        while self.bytes + len > fair_share && !self.entries.is_empty() {
            self.evict_oldest();
        }
        while !self.pool.try_reserve(len) {
            if self.entries.is_empty() {
                debug!(
                    "{}: dropping {len}-byte packet; pool exhausted and buffer empty",
                    self.label
                );
                return;
            }
            self.evict_oldest();
        }
        self.bytes += len;
        self.entries.push_back(pkt);
    }

    /// Drains everything from the oldest entry with `arrival >= cutoff`
    /// forward, truncated forward to the first keyframe, into `sink`. The
    /// buffer is left empty. Returns how many packets were delivered.
    pub fn flush(
        &mut self,
        cutoff: Duration,
        sink: &mut dyn FnMut(&Packet) -> Result<(), Error>,
    ) -> Result<usize, Error> {
        let start = self
            .entries
            .iter()
            .position(|p| p.arrival >= cutoff)
            .and_then(|i| {
                self.entries
                    .iter()
                    .skip(i)
                    .position(|p| p.is_keyframe)
                    .map(|k| i + k)
            });
        let mut delivered = 0;
        let mut result = Ok(());
        if let Some(start) = start {
            for p in self.entries.iter().skip(start) {
                if let Err(e) = sink(p) {
                    result = Err(e);
                    break;
                }
                delivered += 1;
            }
        }
        self.pool.release(self.bytes);
        self.bytes = 0;
        self.entries.clear();
        result.map(|()| delivered)
    }

    pub fn stats(&self) -> BufferStats {
        let duration = match (self.entries.front(), self.entries.back()) {
            (Some(f), Some(b)) => b.arrival.saturating_sub(f.arrival),
            _ => Duration::ZERO,
        };
        BufferStats {
            count: self.entries.len(),
            bytes: self.bytes,
            duration,
        }
    }
}

impl Drop for PacketRingBuffer {
    fn drop(&mut self) {
        self.pool.release(self.bytes);
        self.pool.streams.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::video_packet;
    use bytes::Bytes;

    fn packet_at(secs: u64, is_keyframe: bool, len: usize) -> Packet {
        let mut p = video_packet(secs as i64 * 90_000, is_keyframe);
        p.data = Bytes::from(vec![0u8; len]);
        p.arrival = Duration::from_secs(secs);
        p
    }

    #[test]
    fn time_window_eviction() {
        let pool = PoolBudget::new(1 << 20);
        let mut b = PacketRingBuffer::new("t".into(), pool, Duration::from_secs(3));
        for t in 0..10 {
            b.push(packet_at(t, t % 2 == 0, 100));
        }
        let stats = b.stats();
        // Packets at t=6..=9 fit the 3-second window.
        assert_eq!(stats.count, 4);
        assert_eq!(stats.duration, Duration::from_secs(3));
        assert_eq!(stats.bytes, 400);
    }

    #[test]
    fn pool_cap_never_exceeded() {
        let pool = PoolBudget::new(1000);
        let mut a = PacketRingBuffer::new("a".into(), pool.clone(), Duration::from_secs(60));
        let mut b = PacketRingBuffer::new("b".into(), pool.clone(), Duration::from_secs(60));
        for t in 0..50 {
            a.push(packet_at(t, true, 90));
            b.push(packet_at(t, true, 90));
            assert!(pool.used() <= pool.capacity());
        }
        // Each stream is held to its fair share of the pool.
        assert!(a.stats().bytes <= 500);
        assert!(b.stats().bytes <= 500);
        drop(a);
        drop(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn oversized_packet_dropped() {
        let pool = PoolBudget::new(100);
        let mut b = PacketRingBuffer::new("t".into(), pool.clone(), Duration::from_secs(60));
        b.push(packet_at(0, true, 500));
        assert_eq!(b.stats().count, 0);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn flush_truncates_to_keyframe() {
        // Keyframes every 2 s starting at t=0; buffer filled from t=7..=10.
        let pool = PoolBudget::new(1 << 20);
        let mut b = PacketRingBuffer::new("t".into(), pool, Duration::from_secs(60));
        for t in 7..=10 {
            b.push(packet_at(t, t % 2 == 0, 10));
        }
        // Motion at t=10 with a 3-second pre-buffer: the flush starts at the
        // first keyframe at or after t=7, which is t=8.
        let mut seen = Vec::new();
        let n = b
            .flush(Duration::from_secs(7), &mut |p| {
                seen.push(p.arrival.as_secs());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(seen, &[8, 9, 10]);
        assert!(b.stats().count == 0 && b.stats().bytes == 0);
    }

    #[test]
    fn flush_without_keyframe_delivers_nothing() {
        let pool = PoolBudget::new(1 << 20);
        let mut b = PacketRingBuffer::new("t".into(), pool.clone(), Duration::from_secs(60));
        for t in 0..3 {
            b.push(packet_at(t, false, 10));
        }
        let n = b.flush(Duration::ZERO, &mut |_| Ok(())).unwrap();
        assert_eq!(n, 0);
        assert_eq!(pool.used(), 0);
    }
}
