// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Pre-event ring buffer (§4.B): a bounded, per-stream store of recently
//! decoded packets, so a detection or motion trigger can back-fill the
//! seconds before the event into the eventual recording.
//!
//! Mutations run in amortized O(1) time; eviction never crosses a keyframe
//! boundary, so the oldest retained packet is always a keyframe (or the
//! buffer is empty) and `snapshot_from` can always start a standalone GOP.

use crate::model::BufferStrategy;
use base::time::{Duration, Time};
use std::collections::VecDeque;
use std::sync::Arc;

/// Default byte cap per stream (§4.B); overridable per stream via config.
pub const DEFAULT_MAX_BYTES: usize = 64 << 20;

#[derive(Clone)]
pub struct Packet {
    pub pts: Time,
    pub dts: Time,
    pub is_key: bool,
    pub data: Arc<Vec<u8>>,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("is_key", &self.is_key)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A single stream's ring buffer. Never empty of invariant: after any
/// mutation, the first packet (if any) is a keyframe.
pub struct RingBuffer {
    packets: VecDeque<Packet>,
    max_bytes: usize,
    last_gop_i: usize,
    total_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        RingBuffer {
            packets: VecDeque::new(),
            max_bytes,
            last_gop_i: 0,
            total_bytes: 0,
        }
    }

    /// Builds a ring buffer sized per a stream's configured strategy. `None`
    /// and `Upstream` still get a buffer (the ingest worker simply won't
    /// populate it), matching §4.B's "strategy picks the *source*, not
    /// whether bookkeeping exists".
    pub fn for_strategy(strategy: BufferStrategy) -> Self {
        let max_bytes = match strategy {
            BufferStrategy::MemoryPacket | BufferStrategy::Auto => DEFAULT_MAX_BYTES,
            BufferStrategy::MmapHybrid => DEFAULT_MAX_BYTES * 4,
            BufferStrategy::HlsSegment | BufferStrategy::Upstream | BufferStrategy::None => {
                DEFAULT_MAX_BYTES / 4
            }
        };
        RingBuffer::new(max_bytes)
    }

    /// Appends a packet, then evicts from the front until under the byte cap
    /// -- but never past the most recent keyframe, so live-start and
    /// pre-event snapshots always have one to begin from.
    pub fn push(&mut self, packet: Packet) {
        if packet.is_key {
            self.last_gop_i = self.packets.len();
        }
        self.total_bytes += packet.data.len();
        self.packets.push_back(packet);
        self.evict();
    }

    /// Evicts whole completed GOPs from the front while over the byte cap.
    /// Never evicts into the still-open GOP (`last_gop_i`), so the front
    /// packet remains a keyframe after every call.
    fn evict(&mut self) {
        while self.total_bytes > self.max_bytes {
            let next_key_i = match self.packets.iter().skip(1).position(|p| p.is_key) {
                Some(i) => i + 1,
                None => break,
            };
            if next_key_i > self.last_gop_i {
                break;
            }
            for p in self.packets.drain(..next_key_i) {
                self.total_bytes -= p.data.len();
            }
            self.last_gop_i -= next_key_i;
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn oldest_pts(&self) -> Option<Time> {
        self.packets.front().map(|p| p.pts)
    }

    pub fn newest_pts(&self) -> Option<Time> {
        self.packets.back().map(|p| p.pts)
    }

    /// Returns every packet needed to cover `[now - pre, now]`, clipped
    /// backward to the nearest keyframe at or before that window's start
    /// (§4.B). Returns an empty vec if the buffer holds nothing that old
    /// (the event fired before enough history accumulated).
    pub fn snapshot_from(&self, now: Time, pre: Duration) -> Vec<Packet> {
        let cutoff = now - pre;
        let start_i = self
            .packets
            .iter()
            .rposition(|p| p.is_key && p.pts <= cutoff)
            .unwrap_or(0);
        self.packets.iter().skip(start_i).cloned().collect()
    }
}

/// Per-stream registry of ring buffers, held by the ingest worker set (§4.C).
#[derive(Default)]
pub struct RingBuffers {
    by_stream: base::Mutex<base::FastHashMap<String, RingBuffer>>,
}

impl RingBuffers {
    pub fn new() -> Self {
        RingBuffers::default()
    }

    pub fn register(&self, stream_name: &str, strategy: BufferStrategy) {
        self.by_stream
            .lock()
            .insert(stream_name.to_string(), RingBuffer::for_strategy(strategy));
    }

    pub fn unregister(&self, stream_name: &str) {
        self.by_stream.lock().remove(stream_name);
    }

    pub fn push(&self, stream_name: &str, packet: Packet) {
        if let Some(rb) = self.by_stream.lock().get_mut(stream_name) {
            rb.push(packet);
        }
    }

    pub fn snapshot_from(&self, stream_name: &str, now: Time, pre: Duration) -> Vec<Packet> {
        self.by_stream
            .lock()
            .get(stream_name)
            .map(|rb| rb.snapshot_from(now, pre))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gen {
        next_pts: i64,
    }

    impl Gen {
        fn new() -> Self {
            Gen { next_pts: 0 }
        }

        fn next(&mut self, is_key: bool, size: usize) -> Packet {
            const FRAME_DURATION: i64 = 3000; // 1/30s at 90kHz.
            let pts = Time(self.next_pts);
            self.next_pts += FRAME_DURATION;
            Packet {
                pts,
                dts: pts,
                is_key,
                data: Arc::new(vec![0; size]),
            }
        }
    }

    #[test]
    fn front_is_always_a_keyframe() {
        let mut rb = RingBuffer::new(1024 * 1024);
        let mut gen = Gen::new();
        let one_mb = 1024 * 1024;
        rb.push(gen.next(true, one_mb));
        for _ in 0..10 {
            rb.push(gen.next(true, one_mb));
        }
        assert!(rb.packets.front().unwrap().is_key);
        // Byte cap of 1 MiB can only retain the most recent keyframe.
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn eviction_never_crosses_open_gop() {
        let mut rb = RingBuffer::new(350);
        let mut gen = Gen::new();
        // One GOP: key + 2 deltas, each 100 bytes = 300 bytes, under cap.
        rb.push(gen.next(true, 100));
        rb.push(gen.next(false, 100));
        rb.push(gen.next(false, 100));
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.bytes(), 300);
        // A 4th delta frame in the same (still open) GOP pushes over cap,
        // but there's no older keyframe to evict up to, so nothing is evicted.
        rb.push(gen.next(false, 100));
        assert_eq!(rb.len(), 4);
        assert_eq!(rb.bytes(), 400);
    }

    #[test]
    fn eviction_keeps_last_full_gop() {
        let mut rb = RingBuffer::new(250);
        let mut gen = Gen::new();
        // GOP 1: key + delta (200 bytes).
        rb.push(gen.next(true, 100));
        rb.push(gen.next(false, 100));
        // GOP 2 starts: total would be 300 > 250, evicts GOP 1.
        rb.push(gen.next(true, 100));
        assert_eq!(rb.len(), 1);
        assert!(rb.packets.front().unwrap().is_key);
        assert_eq!(rb.bytes(), 100);
    }

    #[test]
    fn snapshot_clips_to_preceding_keyframe() {
        let mut rb = RingBuffer::new(usize::MAX);
        let mut gen = Gen::new();
        // GOP 1 @ pts 0, 3000, 6000.
        rb.push(gen.next(true, 10));
        rb.push(gen.next(false, 10));
        rb.push(gen.next(false, 10));
        // GOP 2 @ pts 9000, 12000.
        rb.push(gen.next(true, 10));
        rb.push(gen.next(false, 10));

        // A cutoff that lands mid-GOP-2 clips back to the GOP-2 keyframe.
        let snap = rb.snapshot_from(Time(15000), Duration(4000));
        assert_eq!(snap.first().unwrap().pts, Time(9000));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn snapshot_before_any_history_returns_everything() {
        let mut rb = RingBuffer::new(usize::MAX);
        let mut gen = Gen::new();
        rb.push(gen.next(true, 10));
        rb.push(gen.next(false, 10));
        let snap = rb.snapshot_from(Time(0), Duration(90_000));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn registry_round_trips_per_stream() {
        let registry = RingBuffers::new();
        registry.register("cam1", BufferStrategy::MemoryPacket);
        let mut gen = Gen::new();
        registry.push("cam1", gen.next(true, 10));
        registry.push("cam1", gen.next(false, 10));
        let snap = registry.snapshot_from("cam1", Time(3000), Duration(90_000));
        assert_eq!(snap.len(), 2);
        registry.unregister("cam1");
        assert!(registry.snapshot_from("cam1", Time(3000), Duration(90_000)).is_empty());
    }
}
