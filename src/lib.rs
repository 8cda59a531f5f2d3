// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! RustSprite is the sprite/texture cache and compositing core for 2d
//! pixel-art game clients. It deduplicates sprite renders behind a
//! fixed-capacity, hash-indexed LRU cache keyed by the full set of visual
//! parameters, and materializes cache entries through a three-stage
//! asynchronous pipeline (allocate, compose, upload) that runs across the
//! render thread and a configurable number of background workers, one
//! tick ahead of display.
//!
//! The crate owns image decoding (archive priority, bounding-box trim,
//! integer upscaling with optional smoothing, alpha premultiplication),
//! the per-pixel effects (lighting, directional shading, freeze, shine,
//! color balance and two colorize algorithms) and inline text
//! rasterization. Everything game-specific comes in through small seams:
//! graphics archives implement [`archive::Archive`], sprite-range
//! metadata implements [`classify::SpriteClassifier`], and the renderer's
//! graphics API implements [`gpu::Gpu`].
//!
//! The usual frame loop: call [`pipeline::TexturePipeline::prefetch`] for
//! everything visible next tick, [`pipeline::TexturePipeline::pump`] once
//! per tick, and [`pipeline::TexturePipeline::load`] when blitting.

/// Sprite ids at or above this limit are rejected.
pub const MAX_SPRITE: u32 = 250_000;

/// The canonical "missing sprite" placeholder. It must exist in the base
/// archive; a broken install is the only way to miss it.
pub const PLACEHOLDER_SPRITE: u32 = 2;

/// Suggested process exit status for launchers handling
/// [`image::ImageError::GraphicsMissing`].
pub const EXIT_GRAPHICS_MISSING: i32 = 105;

/// read-only graphics archives (mod/patch/base, two resolution tiers)
pub mod archive;

/// the fixed-capacity hash-indexed LRU texture cache
pub mod cache;

/// data-driven sprite traits (smoothing ranges, size adjustments)
pub mod classify;

/// startup configuration
pub mod config;

/// pure per-pixel effects
pub mod effects;

/// the renderer seam: texture creation and the software backend
pub mod gpu;

/// sprite decoding, the image store and the compose stage
pub mod image;

/// log
pub mod log;

/// the prefetch pipeline, worker threads and the renderer facade
pub mod pipeline;

/// statistics for the performance overlay
pub mod stats;

/// inline text rasterization for text fingerprints
pub mod text;

pub use cache::{Fingerprint, SlotGeometry, SpriteFx, TextKey};
pub use config::RenderConfig;
pub use gpu::{Gpu, SoftGpu};
pub use pipeline::TexturePipeline;
