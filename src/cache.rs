// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! The texture cache: a fixed-capacity slot arena indexed two ways at
//! once. A chained hash table maps a visual fingerprint (sprite id plus
//! every effect parameter, or text plus font/color/flags) to its slot, and
//! an intrusive doubly-linked list orders all slots by recency. Both link
//! sets live inside the arena as u32 indices, so the cache is a single
//! relocatable object with no per-entry allocation.
//!
//! A hit moves the slot to the LRU head and to the front of its hash
//! chain (hot entries stay cheap to find on repeat hits within a frame).
//! A miss reuses the LRU tail in place: its resources are released, its
//! generation is bumped to invalidate in-flight prefetch entries, and the
//! slot is relinked under the new fingerprint.
//!
//! Progress through the pipeline stages is published through an atomic
//! flag set so other threads can poll alloc/compose/upload completion
//! without the structural lock. The heavier per-slot payload (staging
//! pixels, GPU texture, geometry) sits behind a per-slot mutex; the
//! compose stage checks the buffer out, works unlocked and checks it back
//! in, with the `BUSY` flag marking the window.
//!
//! Lock order is always structural state before slot payload.

use crate::stats::RenderStats;
use bitflags::bitflags;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Sentinel for "no slot" in all intrusive links.
pub const NO_SLOT: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u16 {
        const USED        = 1 << 0;
        const SPRITE      = 1 << 1;
        const TEXT        = 1 << 2;
        const DID_ALLOC   = 1 << 3;
        const DID_COMPOSE = 1 << 4;
        const DID_UPLOAD  = 1 << 5;
        const BUSY        = 1 << 6;
    }
}

/// Scheduling state of a slot, separate from the progress flags so the
/// eviction scan can tell "safe to reuse" from "a ring entry or worker
/// still references this".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    Idle = 0,
    Queued = 1,
    InWorker = 2,
}

impl WorkState {
    fn from_u8(v: u8) -> WorkState {
        match v {
            1 => WorkState::Queued,
            2 => WorkState::InWorker,
            _ => WorkState::Idle,
        }
    }
}

/// Effect parameters of a sprite fingerprint. Every field takes part in
/// equality: the cache deduplicates exact visual results, nothing fuzzier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpriteFx {
    pub sprite: u32,
    /// Rows of vertical alpha fade at the bottom (submerged objects).
    pub sink: i8,
    pub freeze: u8,
    /// Percent rescale of the source image.
    pub scale: u8,
    // color balance
    pub cr: i16,
    pub cg: i16,
    pub cb: i16,
    pub light: i16,
    pub sat: i16,
    // colorize replacement slots (RGB555, bit 15 = shine feedback)
    pub c1: u16,
    pub c2: u16,
    pub c3: u16,
    pub shine: u16,
    // light levels: middle, left, right, up, down
    pub ml: i8,
    pub ll: i8,
    pub rl: i8,
    pub ul: i8,
    pub dl: i8,
}

impl SpriteFx {
    /// A plain render of the sprite: no effects, full brightness.
    pub fn new(sprite: u32) -> Self {
        Self {
            sprite,
            sink: 0,
            freeze: 0,
            scale: 100,
            cr: 0,
            cg: 0,
            cb: 0,
            light: 0,
            sat: 0,
            c1: 0,
            c2: 0,
            c3: 0,
            shine: 0,
            ml: 15,
            ll: 15,
            rl: 15,
            ul: 15,
            dl: 15,
        }
    }

    fn raw_hash(&self) -> u32 {
        self.sprite
            ^ ((self.ml as u32) << 2)
            ^ ((self.ll as u32) << 4)
            ^ ((self.rl as u32) << 6)
            ^ ((self.ul as u32) << 8)
            ^ ((self.dl as u32) << 10)
    }
}

/// Identity of a rendered text texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextKey {
    pub text: String,
    pub color: u32,
    pub flags: u16,
    pub font: u16,
}

impl TextKey {
    fn raw_hash(&self) -> u32 {
        // the first four bytes act as a fast-reject component
        let b = self.text.as_bytes();
        let t0 = *b.first().unwrap_or(&0) as u32;
        let t1 = *b.get(1).unwrap_or(&0) as u32;
        let t2 = *b.get(2).unwrap_or(&0) as u32;
        let t3 = *b.get(3).unwrap_or(&0) as u32;

        t0 ^ (t1 << 3) ^ (t2 << 6) ^ (t3 << 9) ^ self.color ^ ((self.flags as u32) << 5)
    }
}

/// The cache key: all parameters that determine a rendered result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Sprite(SpriteFx),
    Text(TextKey),
}

impl Fingerprint {
    fn raw_hash(&self) -> u32 {
        match self {
            Fingerprint::Sprite(fx) => fx.raw_hash(),
            Fingerprint::Text(k) => k.raw_hash(),
        }
    }

    pub fn sprite_id(&self) -> Option<u32> {
        match self {
            Fingerprint::Sprite(fx) => Some(fx.sprite),
            Fingerprint::Text(_) => None,
        }
    }
}

/// Post-scale blit geometry of a slot. Width/height and offsets are in
/// base units; the pixel buffer and GPU texture carry the display-scale
/// factor on top. `scale` is the effective percent rescale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotGeometry {
    pub width: u16,
    pub height: u16,
    pub xoff: i16,
    pub yoff: i16,
    pub scale: u32,
}

struct SlotData<T> {
    geom: SlotGeometry,
    staging: Option<Vec<u32>>,
    texture: Option<T>,
}

struct Slot<T> {
    flags: AtomicU16,
    work: AtomicU8,
    generation: AtomicU32,
    data: Mutex<SlotData<T>>,
    done: Condvar,
}

/// Structural state: every link and identity, guarded by one mutex held
/// only across index updates.
struct CacheState {
    keys: Vec<Option<Fingerprint>>,
    ticks: Vec<u32>,
    // recency list
    prev: Vec<u32>,
    next: Vec<u32>,
    head: u32,
    tail: u32,
    // hash chains
    hprev: Vec<u32>,
    hnext: Vec<u32>,
    bucket: Vec<u32>,
    in_use: usize,
}

impl CacheState {
    fn lru_move_front(&mut self, i: u32) {
        let iu = i as usize;
        if self.prev[iu] == NO_SLOT {
            debug_assert_eq!(self.head, i);
            return;
        }
        let p = self.prev[iu];
        let n = self.next[iu];
        self.next[p as usize] = n;
        if n == NO_SLOT {
            self.tail = p;
        } else {
            self.prev[n as usize] = p;
        }
        self.prev[iu] = NO_SLOT;
        self.next[iu] = self.head;
        self.prev[self.head as usize] = i;
        self.head = i;
    }

    fn chain_unlink(&mut self, i: u32, hash: usize) {
        let iu = i as usize;
        let p = self.hprev[iu];
        let n = self.hnext[iu];
        if p == NO_SLOT {
            assert_eq!(self.bucket[hash], i, "hash chain corrupt at bucket {}", hash);
            self.bucket[hash] = n;
        } else {
            self.hnext[p as usize] = n;
        }
        if n != NO_SLOT {
            self.hprev[n as usize] = p;
        }
        self.hprev[iu] = NO_SLOT;
        self.hnext[iu] = NO_SLOT;
    }

    fn chain_push_front(&mut self, i: u32, hash: usize) {
        let iu = i as usize;
        let n = self.bucket[hash];
        if n != NO_SLOT {
            self.hprev[n as usize] = i;
        }
        self.hprev[iu] = NO_SLOT;
        self.hnext[iu] = n;
        self.bucket[hash] = i;
    }
}

/// Why the caller wants the slot. A prefetch hit performs no reordering
/// and a prefetch miss is counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Load,
    Prefetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Exact match; for `Intent::Load` the slot was moved to the front.
    Hit(u32),
    /// The fingerprint was inserted into this (possibly recycled) slot.
    /// The caller must drive alloc → compose → upload before blitting.
    Reserved(u32),
    /// Prefetch found the entry already cached; nothing to do.
    AlreadyCached,
    /// Prefetch could not claim a slot because every eviction candidate is
    /// in flight. Prefetching is best-effort; the request is dropped.
    Busy,
}

pub struct TextureCache<T> {
    slots: Vec<Slot<T>>,
    state: Mutex<CacheState>,
    bucket_mask: u32,
    capacity: usize,
    stats: Arc<RenderStats>,
}

impl<T> TextureCache<T> {
    pub fn new(capacity: usize, stats: Arc<RenderStats>) -> Self {
        assert!(capacity >= 2, "texture cache needs at least two slots");
        let bucket_count = capacity.next_power_of_two();

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                flags: AtomicU16::new(0),
                work: AtomicU8::new(WorkState::Idle as u8),
                generation: AtomicU32::new(1),
                data: Mutex::new(SlotData {
                    geom: SlotGeometry::default(),
                    staging: None,
                    texture: None,
                }),
                done: Condvar::new(),
            });
        }

        let state = CacheState {
            keys: vec![None; capacity],
            ticks: vec![0; capacity],
            prev: (0..capacity as u32)
                .map(|i| if i == 0 { NO_SLOT } else { i - 1 })
                .collect(),
            next: (0..capacity as u32)
                .map(|i| if i as usize == capacity - 1 { NO_SLOT } else { i + 1 })
                .collect(),
            head: 0,
            tail: capacity as u32 - 1,
            hprev: vec![NO_SLOT; capacity],
            hnext: vec![NO_SLOT; capacity],
            bucket: vec![NO_SLOT; bucket_count],
            in_use: 0,
        };

        Self {
            slots,
            state: Mutex::new(state),
            bucket_mask: bucket_count as u32 - 1,
            capacity,
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket_of(&self, key: &Fingerprint) -> usize {
        (key.raw_hash() & self.bucket_mask) as usize
    }

    fn find_in_chain(&self, st: &CacheState, key: &Fingerprint) -> Option<u32> {
        let mut i = st.bucket[self.bucket_of(key)];
        while i != NO_SLOT {
            if st.keys[i as usize].as_ref() == Some(key) {
                // text entries without a texture are failed rasterizations;
                // skip them so the caller builds a fresh one
                if matches!(key, Fingerprint::Text(_))
                    && !self.flags(i).contains(SlotFlags::DID_UPLOAD)
                {
                    i = st.hnext[i as usize];
                    continue;
                }
                return Some(i);
            }
            i = st.hnext[i as usize];
        }
        None
    }

    /// Pure lookup: is this exact visual already cached? No reordering, no
    /// reservation. Used to reject redundant prefetch requests.
    pub fn query(&self, key: &Fingerprint) -> bool {
        let st = self.state.lock().unwrap();
        self.find_in_chain(&st, key).is_some()
    }

    /// The core cache operation: exact-match lookup, front-moving on hit,
    /// evict-and-reuse of the LRU tail on miss.
    pub fn lookup_or_reserve(&self, key: &Fingerprint, intent: Intent, tick: u32) -> Lookup {
        let mut st = self.state.lock().unwrap();

        if let Some(i) = self.find_in_chain(&st, key) {
            if intent == Intent::Prefetch {
                return Lookup::AlreadyCached;
            }
            let hash = self.bucket_of(key);
            st.lru_move_front(i);
            st.chain_unlink(i, hash);
            st.chain_push_front(i, hash);
            st.ticks[i as usize] = tick;
            self.stats.count_hit();
            return Lookup::Hit(i);
        }

        let i = match self.evict_tail(&mut st, intent) {
            Some(i) => i,
            None => return Lookup::Busy,
        };

        st.keys[i as usize] = Some(key.clone());
        st.ticks[i as usize] = tick;
        let hash = self.bucket_of(key);
        st.chain_push_front(i, hash);
        st.lru_move_front(i);

        let kind = match key {
            Fingerprint::Sprite(_) => SlotFlags::USED | SlotFlags::SPRITE,
            Fingerprint::Text(_) => SlotFlags::USED | SlotFlags::TEXT,
        };
        self.slots[i as usize].flags.store(kind.bits(), Ordering::Release);

        match intent {
            Intent::Prefetch => self.stats.count_prefetch(),
            // text misses are expected (text never rides the prefetcher)
            Intent::Load => {
                if matches!(key, Fingerprint::Sprite(_)) {
                    self.stats.count_miss();
                }
            }
        }

        Lookup::Reserved(i)
    }

    /// Pick a reusable slot, starting at the LRU tail and skipping over
    /// slots a ring entry or worker still owns. Running out of candidates
    /// on the foreground path means eviction bookkeeping is broken or the
    /// cache is far too small: a latent bug, never degraded. A prefetch
    /// in the same situation is simply dropped.
    fn evict_tail(&self, st: &mut CacheState, intent: Intent) -> Option<u32> {
        let mut i = st.tail;

        for _ in 0..10 {
            let flags = self.flags(i);
            if flags.is_empty() {
                st.in_use += 1;
                assert!(
                    st.in_use <= self.capacity,
                    "texture cache accounting broken: {} slots in use, capacity {}",
                    st.in_use,
                    self.capacity
                );
                self.stats.set_slots_used(st.in_use as u32);
                return Some(i);
            }

            if self.work_state(i) != WorkState::Idle {
                let candidate = st.prev[i as usize];
                if candidate == NO_SLOT {
                    break;
                }
                i = candidate;
                continue;
            }

            let old_key = st.keys[i as usize]
                .take()
                .expect("in-use slot without a fingerprint");
            let hash = (old_key.raw_hash() & self.bucket_mask) as usize;
            st.chain_unlink(i, hash);

            {
                let mut data = self.slots[i as usize].data.lock().unwrap();
                if flags.contains(SlotFlags::DID_UPLOAD) {
                    if data.texture.take().is_some() {
                        self.stats.add_texture_bytes(
                            -(data.geom.width as i64 * data.geom.height as i64 * 4),
                        );
                    }
                } else if flags.contains(SlotFlags::DID_ALLOC) {
                    data.staging = None;
                }
                data.geom = SlotGeometry::default();
            }

            self.slots[i as usize].flags.store(0, Ordering::Release);

            // invalidate in-flight prefetch entries; 0 is never valid
            let slot = &self.slots[i as usize];
            let mut generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
            if generation == 0 {
                generation = 1;
            }
            slot.generation.store(generation, Ordering::Release);

            return Some(i);
        }

        if intent == Intent::Prefetch {
            return None;
        }
        panic!(
            "texture cache eviction stuck: all LRU candidates busy (capacity {}, in use {})",
            self.capacity, st.in_use
        );
    }

    pub fn flags(&self, i: u32) -> SlotFlags {
        SlotFlags::from_bits_truncate(self.slots[i as usize].flags.load(Ordering::Acquire))
    }

    fn or_flags(&self, i: u32, add: SlotFlags) {
        self.slots[i as usize]
            .flags
            .fetch_or(add.bits(), Ordering::Release);
    }

    pub fn work_state(&self, i: u32) -> WorkState {
        WorkState::from_u8(self.slots[i as usize].work.load(Ordering::Acquire))
    }

    pub fn set_work_state(&self, i: u32, ws: WorkState) {
        self.slots[i as usize].work.store(ws as u8, Ordering::Release);
    }

    pub fn generation(&self, i: u32) -> u32 {
        self.slots[i as usize].generation.load(Ordering::Acquire)
    }

    /// Clone of the slot's fingerprint (if it holds one).
    pub fn key(&self, i: u32) -> Option<Fingerprint> {
        self.state.lock().unwrap().keys[i as usize].clone()
    }

    /// Clone of the slot's sprite parameters, `None` for text slots.
    pub fn sprite_params(&self, i: u32) -> Option<SpriteFx> {
        match self.state.lock().unwrap().keys[i as usize] {
            Some(Fingerprint::Sprite(ref fx)) => Some(fx.clone()),
            _ => None,
        }
    }

    pub fn geometry(&self, i: u32) -> SlotGeometry {
        self.slots[i as usize].data.lock().unwrap().geom
    }

    /// Tick the slot was last requested for (diagnostics).
    pub fn last_requested(&self, i: u32) -> u32 {
        self.state.lock().unwrap().ticks[i as usize]
    }

    // ---- stage transitions -------------------------------------------------

    /// Stage 1 completion: attach the staging buffer and geometry.
    pub fn finish_alloc(&self, i: u32, geom: SlotGeometry, staging: Vec<u32>) {
        let mut data = self.slots[i as usize].data.lock().unwrap();
        data.geom = geom;
        data.staging = Some(staging);
        drop(data);
        self.or_flags(i, SlotFlags::DID_ALLOC);
    }

    /// Claim the compose stage: checks the staging buffer out and marks
    /// the slot busy. `None` when the slot is not allocated yet, already
    /// composed, or owned by another thread.
    pub fn begin_compose(&self, i: u32) -> Option<(SpriteFx, SlotGeometry, Vec<u32>)> {
        let fx = self.sprite_params(i)?;
        let mut data = self.slots[i as usize].data.lock().unwrap();
        let flags = self.flags(i);
        if !flags.contains(SlotFlags::DID_ALLOC)
            || flags.intersects(SlotFlags::DID_COMPOSE | SlotFlags::BUSY)
        {
            return None;
        }
        let staging = data.staging.take()?;
        self.or_flags(i, SlotFlags::BUSY);
        Some((fx, data.geom, staging))
    }

    /// Stage 2 completion: check the composed pixels back in and wake
    /// everyone waiting on this slot.
    pub fn finish_compose(&self, i: u32, staging: Vec<u32>) {
        let slot = &self.slots[i as usize];
        let mut data = slot.data.lock().unwrap();
        data.staging = Some(staging);
        slot.flags
            .fetch_and(!SlotFlags::BUSY.bits(), Ordering::Release);
        slot.flags
            .fetch_or(SlotFlags::DID_COMPOSE.bits(), Ordering::Release);
        drop(data);
        slot.done.notify_all();
    }

    /// Claim the upload stage: takes the staging buffer. `None` before
    /// compose finished or after the upload already happened.
    pub fn begin_upload(&self, i: u32) -> Option<(SlotGeometry, Vec<u32>)> {
        let mut data = self.slots[i as usize].data.lock().unwrap();
        let flags = self.flags(i);
        if !flags.contains(SlotFlags::DID_COMPOSE) || flags.contains(SlotFlags::DID_UPLOAD) {
            return None;
        }
        let staging = data.staging.take()?;
        Some((data.geom, staging))
    }

    /// Stage 3 completion. A `None` texture (zero-sized sprite or text
    /// rasterization failure handled by the caller) still completes the
    /// stage so the pipeline terminates; the blit path just skips it.
    pub fn finish_upload(&self, i: u32, texture: Option<T>) {
        let mut data = self.slots[i as usize].data.lock().unwrap();
        if texture.is_some() {
            self.stats
                .add_texture_bytes(data.geom.width as i64 * data.geom.height as i64 * 4);
        }
        data.texture = texture;
        drop(data);
        self.or_flags(i, SlotFlags::DID_UPLOAD);
    }

    /// Texture creation failed: put the pixels back so a later frame can
    /// retry the upload.
    pub fn fail_upload(&self, i: u32, staging: Vec<u32>) {
        let mut data = self.slots[i as usize].data.lock().unwrap();
        data.staging = Some(staging);
    }

    /// Attach an externally built texture (text path: rasterized and
    /// uploaded inline at reserve time).
    pub fn attach_text_texture(&self, i: u32, geom: SlotGeometry, texture: Option<T>) {
        let uploaded = texture.is_some();
        let mut data = self.slots[i as usize].data.lock().unwrap();
        if uploaded {
            self.stats
                .add_texture_bytes(geom.width as i64 * geom.height as i64 * 4);
        }
        data.geom = geom;
        data.texture = texture;
        drop(data);
        let mut flags = SlotFlags::DID_ALLOC | SlotFlags::DID_COMPOSE;
        if uploaded {
            flags |= SlotFlags::DID_UPLOAD;
        }
        self.or_flags(i, flags);
    }

    /// Block until the slot's compose stage completes. Exhausting the
    /// budget means a worker is stuck or the cache is far too small; both
    /// are treated as fatal, not as a retry case.
    pub fn wait_composed(&self, i: u32, budget: Duration) {
        let slot = &self.slots[i as usize];
        let deadline = Instant::now() + budget;
        let mut data = slot.data.lock().unwrap();
        while !self.flags(i).contains(SlotFlags::DID_COMPOSE) {
            let now = Instant::now();
            if now >= deadline {
                panic!(
                    "render thread timed out waiting for slot {} (flags {:?}, work {:?})",
                    i,
                    self.flags(i),
                    self.work_state(i)
                );
            }
            let (guard, _) = slot.done.wait_timeout(data, deadline - now).unwrap();
            data = guard;
        }
    }

    /// Borrow the slot's texture, if the upload produced one.
    pub fn with_texture<R>(&self, i: u32, f: impl FnOnce(Option<&T>) -> R) -> R {
        let data = self.slots[i as usize].data.lock().unwrap();
        f(data.texture.as_ref())
    }

    /// Mutable borrow, for per-blit alpha modulation.
    pub fn with_texture_mut<R>(&self, i: u32, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut data = self.slots[i as usize].data.lock().unwrap();
        f(data.texture.as_mut())
    }

    /// Debug dump of the live entries, one line each plus totals.
    pub fn dump(&self) -> String {
        let st = self.state.lock().unwrap();
        let mut out = String::new();
        let mut sprites = 0usize;
        let mut texts = 0usize;
        let mut bytes = 0f64;

        for i in 0..self.capacity as u32 {
            let flags = self.flags(i);
            if flags.is_empty() {
                continue;
            }
            let geom = self.geometry(i);
            match st.keys[i as usize] {
                Some(Fingerprint::Sprite(ref fx)) => {
                    sprites += 1;
                    let _ = writeln!(
                        out,
                        "sprite {:6} flags {:?} {}x{} tick {}",
                        fx.sprite, flags, geom.width, geom.height, st.ticks[i as usize]
                    );
                }
                Some(Fingerprint::Text(ref k)) => {
                    texts += 1;
                    let _ = writeln!(
                        out,
                        "text {:?} color {:08X} flags {:?} {}x{}",
                        k.text, k.color, flags, geom.width, geom.height
                    );
                }
                None => {
                    let _ = writeln!(out, "slot {} has flags {:?} but no key!", i, flags);
                }
            }
            bytes += geom.width as f64 * geom.height as f64 * 4.0;
        }

        let _ = writeln!(
            out,
            "{} sprites + {} texts of {} used ({} capacity), {:.2}M texture memory",
            sprites,
            texts,
            st.in_use,
            self.capacity,
            bytes / (1024.0 * 1024.0)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> TextureCache<Vec<u32>> {
        TextureCache::new(capacity, Arc::new(RenderStats::new()))
    }

    fn fx(sprite: u32) -> Fingerprint {
        Fingerprint::Sprite(SpriteFx::new(sprite))
    }

    fn reserve(c: &TextureCache<Vec<u32>>, key: &Fingerprint, tick: u32) -> u32 {
        match c.lookup_or_reserve(key, Intent::Load, tick) {
            Lookup::Reserved(i) => i,
            other => panic!("expected Reserved, got {:?}", other),
        }
    }

    #[test]
    fn distinct_fingerprints_get_distinct_slots() {
        let c = cache(16);
        let a = reserve(&c, &fx(100), 0);
        let mut with_light = SpriteFx::new(100);
        with_light.dl = 7;
        let b = reserve(&c, &Fingerprint::Sprite(with_light), 0);
        assert_ne!(a, b);

        let mut with_c2 = SpriteFx::new(100);
        with_c2.c2 = 0x1f;
        let d = reserve(&c, &Fingerprint::Sprite(with_c2), 0);
        assert_ne!(a, d);
        assert_ne!(b, d);
    }

    #[test]
    fn repeat_lookup_hits_same_slot() {
        let c = cache(16);
        let a = reserve(&c, &fx(5), 1);
        match c.lookup_or_reserve(&fx(5), Intent::Load, 2) {
            Lookup::Hit(i) => assert_eq!(i, a),
            other => panic!("expected Hit, got {:?}", other),
        }
        assert_eq!(c.last_requested(a), 2);
    }

    #[test]
    fn lru_scenario_evicts_oldest_unprotected() {
        // capacity 4: insert A,B,C,D; hit A; insert E -> B is evicted
        let c = cache(4);
        let _a = reserve(&c, &fx(1), 0);
        let b = reserve(&c, &fx(2), 0);
        let _cc = reserve(&c, &fx(3), 0);
        let _d = reserve(&c, &fx(4), 0);

        assert!(matches!(c.lookup_or_reserve(&fx(1), Intent::Load, 1), Lookup::Hit(_)));

        let e = reserve(&c, &fx(5), 2);
        assert_eq!(e, b, "E must reuse B's slot");

        assert!(!c.query(&fx(2)), "B must be unreachable after eviction");
        for s in [1, 3, 4, 5] {
            assert!(c.query(&fx(s)), "sprite {} must survive", s);
        }
    }

    #[test]
    fn in_use_never_exceeds_capacity() {
        let stats = Arc::new(RenderStats::new());
        let c: TextureCache<Vec<u32>> = TextureCache::new(16, stats.clone());
        for s in 0..100 {
            reserve(&c, &fx(s), s);
        }
        assert_eq!(stats.snapshot().slots_used, 16);
    }

    #[test]
    fn prefetch_hit_does_not_reorder() {
        let c = cache(4);
        let _a = reserve(&c, &fx(1), 0);
        reserve(&c, &fx(2), 0);
        reserve(&c, &fx(3), 0);
        reserve(&c, &fx(4), 0);

        // a prefetch hit must not protect sprite 1 from eviction
        assert!(matches!(
            c.lookup_or_reserve(&fx(1), Intent::Prefetch, 1),
            Lookup::AlreadyCached
        ));
        reserve(&c, &fx(5), 2);
        assert!(!c.query(&fx(1)), "prefetch hit must not move sprite 1 to the front");
    }

    #[test]
    fn query_is_pure() {
        let c = cache(4);
        reserve(&c, &fx(1), 0);
        reserve(&c, &fx(2), 0);
        reserve(&c, &fx(3), 0);
        reserve(&c, &fx(4), 0);
        assert!(c.query(&fx(1)));
        // still the LRU tail afterwards
        reserve(&c, &fx(5), 1);
        assert!(!c.query(&fx(1)));
    }

    #[test]
    fn stage_gating_rejects_out_of_order_requests() {
        let c = cache(4);
        let i = reserve(&c, &fx(9), 0);

        // compose before alloc
        assert!(c.begin_compose(i).is_none());
        // upload before compose
        assert!(c.begin_upload(i).is_none());

        let geom = SlotGeometry {
            width: 2,
            height: 2,
            xoff: 0,
            yoff: 0,
            scale: 100,
        };
        c.finish_alloc(i, geom, vec![0; 4]);
        assert!(c.begin_upload(i).is_none(), "upload still gated on compose");

        let (fx_params, geom, buf) = c.begin_compose(i).expect("alloc done, compose may start");
        assert_eq!(fx_params.sprite, 9);
        // second claim while busy fails
        assert!(c.begin_compose(i).is_none());
        c.finish_compose(i, buf);
        assert!(c.begin_compose(i).is_none(), "already composed");

        let (geom2, buf) = c.begin_upload(i).expect("composed, upload may start");
        assert_eq!(geom, geom2);
        c.finish_upload(i, Some(buf));
        assert!(c.flags(i).contains(SlotFlags::DID_UPLOAD));
        assert!(c.begin_upload(i).is_none(), "already uploaded");
    }

    #[test]
    fn eviction_releases_texture_memory() {
        let stats = Arc::new(RenderStats::new());
        let c: TextureCache<Vec<u32>> = TextureCache::new(2, stats.clone());
        let i = reserve(&c, &fx(1), 0);
        let geom = SlotGeometry {
            width: 4,
            height: 4,
            xoff: 0,
            yoff: 0,
            scale: 100,
        };
        c.finish_alloc(i, geom, vec![0; 16]);
        let (_, _, buf) = c.begin_compose(i).unwrap();
        c.finish_compose(i, buf);
        let (_, buf) = c.begin_upload(i).unwrap();
        c.finish_upload(i, Some(buf));
        assert_eq!(stats.snapshot().texture_bytes, 64);

        let old_gen = c.generation(i);
        reserve(&c, &fx(2), 1);
        reserve(&c, &fx(3), 1); // reuses sprite 1's slot
        assert_eq!(stats.snapshot().texture_bytes, 0);
        assert_ne!(c.generation(i), old_gen, "eviction must bump the generation");
    }

    #[test]
    fn busy_tail_is_skipped() {
        let c = cache(4);
        let a = reserve(&c, &fx(1), 0); // will be the tail
        let b = reserve(&c, &fx(2), 0);
        reserve(&c, &fx(3), 0);
        reserve(&c, &fx(4), 0);

        c.set_work_state(a, WorkState::Queued);
        let e = reserve(&c, &fx(5), 1);
        assert_eq!(e, b, "eviction must skip the queued tail and take its neighbor");
        assert!(c.query(&fx(1)));
        c.set_work_state(a, WorkState::Idle);
    }

    #[test]
    #[should_panic(expected = "eviction stuck")]
    fn all_busy_is_fatal() {
        let c = cache(4);
        for s in 1..=4 {
            let i = reserve(&c, &fx(s), 0);
            c.set_work_state(i, WorkState::Queued);
        }
        reserve(&c, &fx(99), 1);
    }

    #[test]
    fn all_busy_prefetch_is_dropped() {
        let c = cache(4);
        for s in 1..=4 {
            let i = reserve(&c, &fx(s), 0);
            c.set_work_state(i, WorkState::Queued);
        }
        assert_eq!(
            c.lookup_or_reserve(&fx(99), Intent::Prefetch, 1),
            Lookup::Busy
        );
        assert!(!c.query(&fx(99)));
    }

    #[test]
    fn failed_text_is_not_a_hit() {
        let c = cache(4);
        let key = Fingerprint::Text(TextKey {
            text: "hello".into(),
            color: 0xffff_ffff,
            flags: 0,
            font: 0,
        });
        let i = reserve(&c, &key, 0);
        // rasterization failed: no texture attached
        c.attach_text_texture(i, SlotGeometry::default(), None);
        assert!(!c.query(&key), "texture-less text entry must not match");

        // a retry reserves a fresh slot and succeeds
        let j = reserve(&c, &key, 1);
        assert_ne!(i, j);
        c.attach_text_texture(
            j,
            SlotGeometry {
                width: 10,
                height: 8,
                xoff: 0,
                yoff: 0,
                scale: 100,
            },
            Some(vec![0; 80]),
        );
        assert!(c.query(&key));
        match c.lookup_or_reserve(&key, Intent::Load, 2) {
            Lookup::Hit(h) => assert_eq!(h, j),
            other => panic!("expected Hit, got {:?}", other),
        }
    }

    #[test]
    fn randomized_traffic_keeps_invariants() {
        use rand::Rng;
        let stats = Arc::new(RenderStats::new());
        let c: TextureCache<Vec<u32>> = TextureCache::new(32, stats.clone());
        let mut rng = rand::rng();
        for tick in 0..2000u32 {
            let mut params = SpriteFx::new(rng.random_range(0..64));
            params.ml = rng.random_range(0..16);
            params.freeze = rng.random_range(0..3);
            let key = Fingerprint::Sprite(params);
            match c.lookup_or_reserve(&key, Intent::Load, tick) {
                Lookup::Hit(_) | Lookup::Reserved(_) => assert!(c.query(&key)),
                other => panic!("unexpected {:?}", other),
            }
            assert!(stats.snapshot().slots_used <= 32);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.slots_used, 32);
        assert!(snap.hits + snap.misses == 2000);
    }

    #[test]
    fn wait_composed_returns_after_finish() {
        let c = Arc::new(cache(4));
        let i = reserve(&c, &fx(1), 0);
        c.finish_alloc(
            i,
            SlotGeometry {
                width: 1,
                height: 1,
                xoff: 0,
                yoff: 0,
                scale: 100,
            },
            vec![0; 1],
        );
        let (_, _, buf) = c.begin_compose(i).unwrap();

        let c2 = c.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c2.finish_compose(i, buf);
        });
        c.wait_composed(i, Duration::from_secs(2));
        assert!(c.flags(i).contains(SlotFlags::DID_COMPOSE));
        t.join().unwrap();
    }
}
