// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Shared counters for the cache and decoder, exported read-only for the
//! on-screen performance overlay. Updates use relaxed atomics; the numbers
//! are diagnostics, not control state.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

#[derive(Default)]
pub struct RenderStats {
    hits: AtomicU64,
    misses: AtomicU64,
    prefetched: AtomicU64,
    image_bytes: AtomicI64,
    texture_bytes: AtomicI64,
    slots_used: AtomicU32,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub prefetched: u64,
    pub image_bytes: i64,
    pub texture_bytes: i64,
    pub slots_used: u32,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_prefetch(&self) {
        self.prefetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_image_bytes(&self, bytes: i64) {
        self.image_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_texture_bytes(&self, bytes: i64) {
        self.texture_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_slots_used(&self, used: u32) {
        self.slots_used.store(used, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
            image_bytes: self.image_bytes.load(Ordering::Relaxed),
            texture_bytes: self.texture_bytes.load(Ordering::Relaxed),
            slots_used: self.slots_used.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let s = RenderStats::new();
        s.count_hit();
        s.count_hit();
        s.count_miss();
        s.add_texture_bytes(4096);
        s.add_texture_bytes(-4096);
        let snap = s.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.texture_bytes, 0);
    }
}
