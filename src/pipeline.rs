// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! The asynchronous prefetch pipeline and the facade the renderer talks
//! to.
//!
//! The renderer seeds the bounded prefetch ring one tick ahead of
//! display. Three cooperating stages then materialize each slot: stage 1
//! decodes the source image and allocates the staging buffer, stage 2
//! composes the pixels, stage 3 uploads them as a GPU texture. Stage 1
//! and stage 3 run on the render thread inside [`TexturePipeline::pump`];
//! stage 2 runs on the configured worker threads (or inline when there
//! are none). A full ring drops new requests: prefetching hides latency,
//! it is never load-bearing for correctness.
//!
//! The foreground path ([`TexturePipeline::load`]) drives the same stage
//! functions synchronously when the renderer needs a texture right now.
//! If a worker owns the slot's compose stage, the render thread waits on
//! the slot with a bounded budget; exhausting it is fatal (a stuck worker
//! or a cache that is far too small, not a transient condition).
//!
//! Workers loop wait-for-signal → compose one slot → repeat. The signal
//! is posted when stage 1 finishes an allocation, when the ring is full
//! (as a nudge), when a worker completes a compose, and once per worker
//! at shutdown after the quit flag is raised.

use crate::archive::ArchiveSet;
use crate::cache::{
    Fingerprint, Intent, Lookup, SlotFlags, SlotGeometry, SpriteFx, TextKey, TextureCache,
    WorkState, NO_SLOT,
};
use crate::classify::SpriteClassifier;
use crate::config::RenderConfig;
use crate::effects::LightMode;
use crate::gpu::Gpu;
use crate::image::{self, ImageError, ImageStore};
use crate::stats::{RenderStats, StatsSnapshot};
use crate::text::{maketext, FontStore, TextStyle};
use crate::MAX_SPRITE;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Prefetch ring capacity.
pub const MAX_PREFETCH: usize = 16384;

/// Budget for the render thread's wait on a worker-owned slot.
const COMPOSE_WAIT_BUDGET: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
struct PreEntry {
    slot: u32,
    /// Snapshot of the slot's generation at queue time; a mismatch means
    /// the slot was evicted and the entry is stale.
    generation: u32,
    tick: u32,
}

const EMPTY_ENTRY: PreEntry = PreEntry {
    slot: NO_SLOT,
    generation: 0,
    tick: 0,
};

/// The ring buffer: one write cursor and one read cursor per stage. The
/// buffer is full when the write cursor would catch up with the slowest
/// stage.
struct RingState {
    entries: Vec<PreEntry>,
    pre_in: usize,
    pre_1: usize,
    pre_2: usize,
    pre_3: usize,
}

impl RingState {
    fn new() -> Self {
        Self {
            entries: vec![EMPTY_ENTRY; MAX_PREFETCH],
            pre_in: 0,
            pre_1: 0,
            pre_2: 0,
            pre_3: 0,
        }
    }

    fn backlog(&self) -> usize {
        let gap = |a: usize, b: usize| {
            if a >= b {
                a - b
            } else {
                MAX_PREFETCH + a - b
            }
        };
        gap(self.pre_in, self.pre_1) + gap(self.pre_1, self.pre_2) + gap(self.pre_2, self.pre_3)
    }
}

/// Counting wake signal for the workers.
struct WorkSignal {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WorkSignal {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Everything the worker threads share with the render thread.
struct Shared<T> {
    cache: TextureCache<T>,
    images: ImageStore,
    ring: Mutex<RingState>,
    signal: WorkSignal,
    quit: AtomicBool,
    light_mode: LightMode,
    workers: usize,
}

fn entry_settled<T>(shared: &Shared<T>, e: &PreEntry) -> bool {
    e.slot == NO_SLOT
        || shared.cache.generation(e.slot) != e.generation
        || shared.cache.flags(e.slot).contains(SlotFlags::DID_COMPOSE)
}

/// Stage 2: compose the first eligible ring entry, then advance the
/// compose cursor past everything settled. Runs on workers and, without
/// workers, on the render thread.
fn run_stage2<T>(shared: &Shared<T>) -> bool {
    let found = {
        let ring = shared.ring.lock().unwrap();
        let mut i = ring.pre_2;
        let mut found = None;
        while i != ring.pre_1 {
            let e = ring.entries[i];
            if e.slot != NO_SLOT && shared.cache.generation(e.slot) == e.generation {
                let flags = shared.cache.flags(e.slot);
                if flags.contains(SlotFlags::DID_ALLOC)
                    && !flags.intersects(SlotFlags::DID_COMPOSE | SlotFlags::BUSY)
                {
                    found = Some(e.slot);
                    break;
                }
            }
            i = (i + 1) % MAX_PREFETCH;
        }
        found
    };

    let mut did_work = false;
    if let Some(slot) = found {
        // begin_compose is the atomic claim; losing the race is fine
        if let Some((fx, geom, mut staging)) = shared.cache.begin_compose(slot) {
            shared.cache.set_work_state(slot, WorkState::InWorker);
            match shared.images.get(fx.sprite) {
                Some(si) => image::compose(&fx, &si, &geom, shared.light_mode, &mut staging),
                None => warn!("compose without a decoded image for sprite {}", fx.sprite),
            }
            shared.cache.finish_compose(slot, staging);
            shared.cache.set_work_state(slot, WorkState::Queued);
            did_work = true;
            if shared.workers > 0 {
                // pipeline further queued work
                shared.signal.post(1);
            }
        }
    }

    let mut ring = shared.ring.lock().unwrap();
    while ring.pre_2 != ring.pre_1 {
        let e = ring.entries[ring.pre_2];
        if !entry_settled(shared, &e) {
            break;
        }
        did_work = true;
        ring.pre_2 = (ring.pre_2 + 1) % MAX_PREFETCH;
    }

    did_work
}

fn worker_main<T>(shared: Arc<Shared<T>>, index: usize) {
    info!("background worker {} up", index);
    loop {
        shared.signal.wait();
        if shared.quit.load(Ordering::Acquire) {
            break;
        }
        run_stage2(shared.as_ref());
    }
    info!("background worker {} down", index);
}

/// The renderer-facing texture system: cache, decoder, prefetch ring and
/// worker threads behind one handle.
pub struct TexturePipeline<G: Gpu> {
    shared: Arc<Shared<G::Texture>>,
    archives: ArchiveSet,
    classifier: Box<dyn SpriteClassifier>,
    fonts: FontStore,
    stats: Arc<RenderStats>,
    scale: u32,
    worker_handles: Vec<JoinHandle<()>>,
}

impl<G: Gpu> TexturePipeline<G> {
    pub fn new(
        cfg: &RenderConfig,
        archives: ArchiveSet,
        classifier: Box<dyn SpriteClassifier>,
    ) -> Self {
        let stats = Arc::new(RenderStats::new());
        let shared = Arc::new(Shared {
            cache: TextureCache::new(cfg.cache_size, stats.clone()),
            images: ImageStore::new(stats.clone()),
            ring: Mutex::new(RingState::new()),
            signal: WorkSignal::new(),
            quit: AtomicBool::new(false),
            light_mode: cfg.light_mode,
            workers: cfg.workers,
        });

        let worker_handles = (0..cfg.workers)
            .map(|n| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("sprite worker {}", n))
                    .spawn(move || worker_main(shared, n))
                    .expect("failed to spawn sprite worker")
            })
            .collect();

        info!(
            "texture pipeline up: cache {} scale {} workers {}",
            cfg.cache_size, cfg.scale, cfg.workers
        );

        Self {
            shared,
            archives,
            classifier,
            fonts: FontStore::new(),
            stats,
            scale: cfg.scale,
            worker_handles,
        }
    }

    pub fn fonts_mut(&mut self) -> &mut FontStore {
        &mut self.fonts
    }

    /// Foreground path: return a blit-ready slot for the fingerprint,
    /// driving the stages synchronously where the prefetcher has not
    /// finished them. `Ok(None)` means this draw is skipped (illegal
    /// sprite id or failed text); only a broken graphics install is an
    /// error.
    pub fn load(&self, gpu: &mut G, key: &Fingerprint, tick: u32) -> Result<Option<u32>, ImageError> {
        if let Some(sprite) = key.sprite_id() {
            if sprite >= MAX_SPRITE {
                warn!("illegal sprite {} wanted in load", sprite);
                return Ok(None);
            }
        }

        match self.shared.cache.lookup_or_reserve(key, Intent::Load, tick) {
            Lookup::Hit(i) => {
                if self.shared.cache.flags(i).contains(SlotFlags::SPRITE) {
                    match self.finish_foreground(gpu, i) {
                        Ok(()) => {}
                        Err(ImageError::IllegalSprite(_)) => return Ok(None),
                        Err(e) => return Err(e),
                    }
                }
                Ok(Some(i))
            }
            Lookup::Reserved(i) => match key {
                Fingerprint::Sprite(_) => match self.finish_foreground(gpu, i) {
                    Ok(()) => Ok(Some(i)),
                    Err(ImageError::IllegalSprite(_)) => Ok(None),
                    Err(e) => Err(e),
                },
                Fingerprint::Text(k) => {
                    self.build_text(gpu, i, k);
                    if self.shared.cache.flags(i).contains(SlotFlags::DID_UPLOAD) {
                        Ok(Some(i))
                    } else {
                        Ok(None)
                    }
                }
            },
            Lookup::AlreadyCached | Lookup::Busy => unreachable!("load never prefetches"),
        }
    }

    /// Seed the prefetch ring one tick ahead of display. Best-effort: a
    /// full ring or an all-busy cache drops the request.
    pub fn prefetch(&self, tick: u32, fx: SpriteFx) {
        {
            let ring = self.shared.ring.lock().unwrap();
            if (ring.pre_in + 1) % MAX_PREFETCH == ring.pre_3 {
                drop(ring);
                // buffer is full: nudge the workers and drop the request
                if self.shared.workers > 0 {
                    self.shared.signal.post(1);
                }
                return;
            }
        }

        if fx.sprite >= MAX_SPRITE {
            warn!("illegal sprite {} wanted in prefetch", fx.sprite);
            return;
        }

        let key = Fingerprint::Sprite(fx);
        match self
            .shared
            .cache
            .lookup_or_reserve(&key, Intent::Prefetch, tick)
        {
            Lookup::AlreadyCached | Lookup::Busy => {}
            Lookup::Reserved(i) => {
                let mut ring = self.shared.ring.lock().unwrap();
                self.shared.cache.set_work_state(i, WorkState::Queued);
                let at = ring.pre_in;
                ring.entries[at] = PreEntry {
                    slot: i,
                    generation: self.shared.cache.generation(i),
                    tick,
                };
                ring.pre_in = (at + 1) % MAX_PREFETCH;
            }
            Lookup::Hit(_) => unreachable!("prefetch hits report AlreadyCached"),
        }
    }

    /// Per-tick drive from the render thread: one allocation, the compose
    /// stage when no workers exist, one upload. Returns the number of ring
    /// entries still in flight.
    pub fn pump(&self, gpu: &mut G) -> Result<usize, ImageError> {
        self.stage1()?;
        if self.shared.workers == 0 {
            run_stage2(self.shared.as_ref());
        } else {
            // the compose cursor itself only moves under the ring lock;
            // keep it moving even while every worker is busy elsewhere
            let mut ring = self.shared.ring.lock().unwrap();
            while ring.pre_2 != ring.pre_1 {
                let e = ring.entries[ring.pre_2];
                if !entry_settled(self.shared.as_ref(), &e) {
                    break;
                }
                ring.pre_2 = (ring.pre_2 + 1) % MAX_PREFETCH;
            }
        }
        self.stage3(gpu);
        Ok(self.shared.ring.lock().unwrap().backlog())
    }

    /// Stage 1: decode the source image and allocate the staging buffer
    /// for the oldest pending entry.
    fn stage1(&self) -> Result<bool, ImageError> {
        let entry = {
            let ring = self.shared.ring.lock().unwrap();
            if ring.pre_in == ring.pre_1 {
                return Ok(false);
            }
            ring.entries[ring.pre_1]
        };

        if entry.slot != NO_SLOT
            && self.shared.cache.generation(entry.slot) == entry.generation
            && !self
                .shared
                .cache
                .flags(entry.slot)
                .contains(SlotFlags::DID_ALLOC)
        {
            self.ensure_alloc(entry.slot)?;
            if self.shared.workers > 0 {
                self.shared.signal.post(1);
            }
        }

        let mut ring = self.shared.ring.lock().unwrap();
        ring.pre_1 = (ring.pre_1 + 1) % MAX_PREFETCH;
        Ok(true)
    }

    /// Stage 3: upload the oldest composed entry and release its ring
    /// claim on the slot.
    fn stage3(&self, gpu: &mut G) -> bool {
        let entry = {
            let ring = self.shared.ring.lock().unwrap();
            if ring.pre_2 == ring.pre_3 {
                return false;
            }
            ring.entries[ring.pre_3]
        };

        if entry.slot != NO_SLOT && self.shared.cache.generation(entry.slot) == entry.generation {
            let flags = self.shared.cache.flags(entry.slot);
            if flags.contains(SlotFlags::DID_COMPOSE) && !flags.contains(SlotFlags::DID_UPLOAD) {
                self.upload(gpu, entry.slot);
            }
            self.shared.cache.set_work_state(entry.slot, WorkState::Idle);
        }

        let mut ring = self.shared.ring.lock().unwrap();
        ring.pre_3 = (ring.pre_3 + 1) % MAX_PREFETCH;
        true
    }

    /// Decode the slot's sprite and attach an empty staging buffer.
    /// Render-thread only.
    fn ensure_alloc(&self, i: u32) -> Result<(), ImageError> {
        let cache = &self.shared.cache;
        if cache.flags(i).contains(SlotFlags::DID_ALLOC) {
            return Ok(());
        }
        let Some(fx) = cache.sprite_params(i) else {
            return Ok(());
        };
        let si = self
            .shared
            .images
            .load(fx.sprite, &self.archives, self.scale, self.classifier.as_ref())?;
        let traits = self.classifier.traits(fx.sprite);
        let geom = image::output_geometry(&fx, &si, traits);
        let len =
            geom.width as usize * geom.height as usize * (self.scale * self.scale) as usize;
        cache.finish_alloc(i, geom, vec![0u32; len]);
        Ok(())
    }

    /// Drive one sprite slot to uploaded, waiting (bounded) on a worker
    /// that owns its compose stage.
    fn finish_foreground(&self, gpu: &mut G, i: u32) -> Result<(), ImageError> {
        let cache = &self.shared.cache;
        if !cache.flags(i).contains(SlotFlags::DID_ALLOC) {
            self.ensure_alloc(i)?;
        }
        if !cache.flags(i).contains(SlotFlags::DID_COMPOSE) {
            if let Some((fx, geom, mut staging)) = cache.begin_compose(i) {
                match self.shared.images.get(fx.sprite) {
                    Some(si) => image::compose(&fx, &si, &geom, self.shared.light_mode, &mut staging),
                    None => warn!("compose without a decoded image for sprite {}", fx.sprite),
                }
                cache.finish_compose(i, staging);
            } else {
                cache.wait_composed(i, COMPOSE_WAIT_BUDGET);
            }
        }
        if !cache.flags(i).contains(SlotFlags::DID_UPLOAD) {
            self.upload(gpu, i);
        }
        Ok(())
    }

    fn upload(&self, gpu: &mut G, i: u32) {
        let cache = &self.shared.cache;
        let Some((geom, staging)) = cache.begin_upload(i) else {
            return;
        };
        let w = geom.width as u32 * self.scale;
        let h = geom.height as u32 * self.scale;
        if w == 0 || h == 0 {
            // zero-sized sprite: cache a texture-less slot so the
            // pipeline terminates; the blit path skips it
            cache.finish_upload(i, None);
            return;
        }
        match gpu.create_texture(w, h, &staging) {
            Ok(tex) => cache.finish_upload(i, Some(tex)),
            Err(e) => {
                warn!("texture upload failed for slot {}: {}", i, e);
                // keep the pixels so a later frame can retry
                cache.fail_upload(i, staging);
            }
        }
    }

    /// Rasterize and upload a text slot inline. Failure leaves the slot
    /// texture-less; the next lookup will build a fresh one.
    fn build_text(&self, gpu: &mut G, i: u32, key: &TextKey) {
        let cache = &self.shared.cache;
        let Some(handle) = self.fonts.get(key.font) else {
            warn!("unknown font {} in text fingerprint", key.font);
            cache.attach_text_texture(i, SlotGeometry::default(), None);
            return;
        };

        let style = TextStyle::from_bits_truncate(key.flags);
        let rendered = maketext(handle, &key.text, key.color, style, self.scale);
        let geom = SlotGeometry {
            width: rendered.width as u16,
            height: rendered.height as u16,
            xoff: 0,
            yoff: 0,
            scale: 100,
        };
        match gpu.create_texture(rendered.width, rendered.height, &rendered.pixels) {
            Ok(tex) => cache.attach_text_texture(i, geom, Some(tex)),
            Err(e) => {
                warn!("maketext upload failed for {:?}: {}", key.text, e);
                cache.attach_text_texture(i, geom, None);
            }
        }
    }

    // ---- read-only surface -------------------------------------------------

    /// Is this exact visual already cached? No mutation, no load.
    pub fn query(&self, key: &Fingerprint) -> bool {
        self.shared.cache.query(key)
    }

    /// Has the slot finished its upload stage?
    pub fn ready(&self, i: u32) -> bool {
        self.shared.cache.flags(i).contains(SlotFlags::DID_UPLOAD)
    }

    pub fn geometry(&self, i: u32) -> SlotGeometry {
        self.shared.cache.geometry(i)
    }

    /// Borrow the slot's texture for blitting; `None` while the upload is
    /// pending or for texture-less slots.
    pub fn with_texture<R>(&self, i: u32, f: impl FnOnce(Option<&G::Texture>) -> R) -> R {
        self.shared.cache.with_texture(i, f)
    }

    /// Per-blit alpha modulation on the slot's texture.
    pub fn set_texture_alpha(&self, gpu: &mut G, i: u32, alpha: u8) {
        self.shared.cache.with_texture_mut(i, |tex| {
            if let Some(tex) = tex {
                gpu.set_texture_alpha(tex, alpha);
            }
        });
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Debug dump of the cache contents.
    pub fn dump(&self) -> String {
        self.shared.cache.dump()
    }

    /// Raise the quit flag and join the workers. Queued work is
    /// abandoned, not completed.
    pub fn shutdown(&mut self) {
        if self.worker_handles.is_empty() {
            return;
        }
        self.shared.quit.store(true, Ordering::Release);
        self.shared.signal.post(self.worker_handles.len());
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<G: Gpu> Drop for TexturePipeline<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{sprite_filename, ArchiveTier, MemArchive};
    use crate::classify;
    use crate::gpu::SoftGpu;
    use image_crate_helpers::solid_png;

    mod image_crate_helpers {
        use image::{Rgba, RgbaImage};
        use std::io::Cursor;

        pub fn solid_png(w: u32, h: u32, rgba: [u8; 4]) -> Vec<u8> {
            let img = RgbaImage::from_pixel(w, h, Rgba(rgba));
            let mut buf = Vec::new();
            image::DynamicImage::ImageRgba8(img)
                .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
                .unwrap();
            buf
        }
    }

    fn test_pipeline(workers: usize, sprites: &[(u32, [u8; 4])]) -> TexturePipeline<SoftGpu> {
        let mut base = MemArchive::new("base");
        base.insert(
            &sprite_filename(crate::PLACEHOLDER_SPRITE),
            solid_png(2, 2, [9, 9, 9, 255]),
        );
        for &(sprite, rgba) in sprites {
            base.insert(&sprite_filename(sprite), solid_png(4, 4, rgba));
        }
        let archives = ArchiveSet::from_tiers(
            ArchiveTier::default(),
            ArchiveTier {
                modded: None,
                patch: None,
                base: Some(Box::new(base)),
            },
        );
        let cfg = RenderConfig {
            cache_size: 64,
            workers,
            ..Default::default()
        };
        TexturePipeline::new(&cfg, archives, Box::new(classify::builtin().clone()))
    }

    #[test]
    fn foreground_load_produces_texture() {
        let pipe = test_pipeline(0, &[(10, [100, 0, 0, 255])]);
        let mut gpu = SoftGpu::new();

        let slot = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(10)), 1)
            .unwrap()
            .expect("slot");
        assert!(pipe.ready(slot));
        let geom = pipe.geometry(slot);
        assert_eq!((geom.width, geom.height), (4, 4));
        pipe.with_texture(slot, |tex| {
            let tex = tex.expect("uploaded");
            assert_eq!((tex.width, tex.height), (4, 4));
            assert!(tex.pixels.iter().all(|&p| p == 0xff64_0000));
        });
        assert_eq!(gpu.created, 1);
        assert_eq!(pipe.stats().misses, 1);

        // idempotent hit: same slot, zero new GPU work
        let again = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(10)), 2)
            .unwrap()
            .unwrap();
        assert_eq!(again, slot);
        assert_eq!(gpu.created, 1);
        assert_eq!(pipe.stats().hits, 1);
    }

    #[test]
    fn illegal_sprite_is_skipped() {
        let pipe = test_pipeline(0, &[]);
        let mut gpu = SoftGpu::new();
        let slot = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(MAX_SPRITE + 5)), 0)
            .unwrap();
        assert!(slot.is_none());
        assert_eq!(gpu.created, 0);
    }

    #[test]
    fn missing_archives_are_fatal() {
        let archives = ArchiveSet::from_tiers(ArchiveTier::default(), ArchiveTier::default());
        let cfg = RenderConfig {
            cache_size: 64,
            ..Default::default()
        };
        let pipe: TexturePipeline<SoftGpu> =
            TexturePipeline::new(&cfg, archives, Box::new(classify::builtin().clone()));
        let mut gpu = SoftGpu::new();
        match pipe.load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(10)), 0) {
            Err(ImageError::GraphicsMissing) => {}
            other => panic!("expected GraphicsMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn prefetch_pipeline_finishes_ahead_of_display() {
        let pipe = test_pipeline(0, &[(20, [0, 100, 0, 255]), (21, [0, 0, 100, 255])]);
        let mut gpu = SoftGpu::new();

        pipe.prefetch(5, SpriteFx::new(20));
        pipe.prefetch(5, SpriteFx::new(21));
        // a redundant prefetch neither queues nor reserves twice
        pipe.prefetch(5, SpriteFx::new(20));

        let mut backlog = usize::MAX;
        for _ in 0..16 {
            backlog = pipe.pump(&mut gpu).unwrap();
            if backlog == 0 {
                break;
            }
        }
        assert_eq!(backlog, 0);
        assert_eq!(gpu.created, 2);
        assert_eq!(pipe.stats().prefetched, 2);

        // the renderer's load is now a pure hit
        let slot = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(20)), 6)
            .unwrap()
            .unwrap();
        assert!(pipe.ready(slot));
        assert_eq!(gpu.created, 2);
    }

    #[test]
    fn workers_compose_in_background() {
        let mut pipe = test_pipeline(
            2,
            &[
                (30, [10, 0, 0, 255]),
                (31, [0, 10, 0, 255]),
                (32, [0, 0, 10, 255]),
                (33, [10, 10, 0, 255]),
            ],
        );
        let mut gpu = SoftGpu::new();

        for s in 30..=33 {
            pipe.prefetch(1, SpriteFx::new(s));
        }

        let mut done = false;
        for _ in 0..400 {
            if pipe.pump(&mut gpu).unwrap() == 0 {
                done = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(done, "pipeline never drained");
        for s in 30..=33 {
            assert!(pipe.query(&Fingerprint::Sprite(SpriteFx::new(s))));
        }
        assert_eq!(gpu.created, 4);

        // foreground load against worker-composed slots is a plain hit
        let slot = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(30)), 2)
            .unwrap()
            .unwrap();
        assert!(pipe.ready(slot));

        pipe.shutdown();
    }

    #[test]
    fn missing_sprite_renders_placeholder() {
        let pipe = test_pipeline(0, &[]);
        let mut gpu = SoftGpu::new();
        let slot = pipe
            .load(&mut gpu, &Fingerprint::Sprite(SpriteFx::new(777)), 0)
            .unwrap()
            .expect("placeholder slot");
        assert!(pipe.ready(slot));
        pipe.with_texture(slot, |tex| {
            let tex = tex.expect("uploaded placeholder");
            assert!(tex.pixels.iter().all(|&p| p == 0xff09_0909));
        });
    }

    #[test]
    fn stats_reflect_cache_traffic() {
        let pipe = test_pipeline(0, &[(40, [1, 2, 3, 255])]);
        let mut gpu = SoftGpu::new();
        let key = Fingerprint::Sprite(SpriteFx::new(40));
        pipe.load(&mut gpu, &key, 0).unwrap();
        pipe.load(&mut gpu, &key, 1).unwrap();
        pipe.load(&mut gpu, &key, 2).unwrap();
        let snap = pipe.stats();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.slots_used, 1);
        assert!(snap.image_bytes > 0);
        assert_eq!(snap.texture_bytes, 64);
        assert!(pipe.dump().contains("sprite     40"));
    }
}
