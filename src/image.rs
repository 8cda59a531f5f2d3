// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Sprite image decoding and pixel composition.
//!
//! Decoding produces one immutable [`SourceImage`] per sprite id: the PNG
//! is fetched from the highest-priority archive that has it, trimmed to
//! its visible bounding box (fully transparent and magenta chroma-key
//! pixels do not count as visible), upscaled to the display scale and
//! premultiplied. High-res archives carry natively scaled assets; low-res
//! assets are replicated pixel-wise and optionally smoothed first.
//! Premultiplication always runs after smoothing, because smoothing on
//! premultiplied color darkens edges.
//!
//! [`ImageStore`] keeps the decoded images. Loading is idempotent and safe
//! to race: a per-sprite atomic state machine (unloaded → loading →
//! ready | failed) lets the losing thread wait for the winner's result.
//! Decoded images stay resident until the store drops.
//!
//! [`compose`] is the pipeline's stage 2: it samples the source image
//! (bilinear when the fingerprint rescales), then applies colorize, color
//! balance, directional or flat lighting, shine, the sink alpha cut and
//! the freeze tint, writing the slot's staging pixels.

use crate::archive::{sprite_filename, ArchiveSet};
use crate::cache::{SlotGeometry, SpriteFx};
use crate::classify::{SpriteClassifier, SpriteTraits};
use crate::effects::{self, LightMode};
use crate::stats::RenderStats;
use crate::{MAX_SPRITE, PLACEHOLDER_SPRITE};
use image::DynamicImage;
use log::{error, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One decoded sprite: premultiplied ARGB pixels at display scale.
/// `width`/`height` and the offsets are in unscaled base units; the pixel
/// buffer is `width * scale` by `height * scale`.
pub struct SourceImage {
    pub pixels: Vec<u32>,
    pub width: u16,
    pub height: u16,
    /// Placement offset relative to the sprite's logical origin, computed
    /// from the pre-trim image center.
    pub xoff: i16,
    pub yoff: i16,
    /// Display scale the pixels were decoded at.
    pub scale: u32,
}

impl SourceImage {
    pub fn byte_size(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<u32>()
    }
}

#[derive(Debug)]
pub enum DecodeError {
    /// No archive provides the sprite.
    NotFound,
    /// An archive provides it but the data is structurally unusable.
    Corrupt(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::NotFound => write!(f, "not found in any archive"),
            DecodeError::Corrupt(msg) => write!(f, "corrupt image: {}", msg),
        }
    }
}

#[derive(Debug)]
pub enum ImageError {
    IllegalSprite(u32),
    /// The base archive (or the placeholder inside it) is unavailable.
    /// This is a broken installation, not a recoverable decode failure.
    GraphicsMissing,
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::IllegalSprite(s) => write!(f, "illegal sprite {}", s),
            ImageError::GraphicsMissing => write!(
                f,
                "The client could not locate the graphics archive gx1. \
                 Please make sure you start the client from the main folder, \
                 not from within the bin folder.\n\n\
                 You can create a shortcut with the working directory set to \
                 the main folder."
            ),
        }
    }
}

impl std::error::Error for ImageError {}

enum RawPixels {
    Rgb(image::RgbImage),
    Rgba(image::RgbaImage),
}

impl RawPixels {
    fn dims(&self) -> (u32, u32) {
        match self {
            RawPixels::Rgb(b) => b.dimensions(),
            RawPixels::Rgba(b) => b.dimensions(),
        }
    }

    /// Straight-alpha sample; magenta is the chroma key and reads as
    /// fully transparent in both formats.
    fn rgba(&self, x: u32, y: u32) -> (u32, u32, u32, u32) {
        let (r, g, b, a) = match self {
            RawPixels::Rgb(img) => {
                let p = img.get_pixel(x, y).0;
                (p[0] as u32, p[1] as u32, p[2] as u32, 255)
            }
            RawPixels::Rgba(img) => {
                let p = img.get_pixel(x, y).0;
                (p[0] as u32, p[1] as u32, p[2] as u32, p[3] as u32)
            }
        };
        if r == 255 && g == 0 && b == 255 {
            (r, g, b, 0)
        } else {
            (r, g, b, a)
        }
    }

    fn visible(&self, x: u32, y: u32) -> bool {
        self.rgba(x, y).3 != 0
    }
}

fn decode_raw(data: &[u8]) -> Result<RawPixels, DecodeError> {
    let img = image::load_from_memory(data).map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    match img {
        DynamicImage::ImageRgb8(b) => Ok(RawPixels::Rgb(b)),
        DynamicImage::ImageRgba8(b) => Ok(RawPixels::Rgba(b)),
        other => Err(DecodeError::Corrupt(format!(
            "unexpected pixel format {:?}",
            other.color()
        ))),
    }
}

/// Visible bounding box (sx, sy, ex, ey), ex/ey inclusive. `None` when the
/// image has no visible pixel at all.
fn trim_bounds(raw: &RawPixels) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = raw.dims();
    let (mut sx, mut sy, mut ex, mut ey) = (w, h, 0u32, 0u32);
    for y in 0..h {
        for x in 0..w {
            if !raw.visible(x, y) {
                continue;
            }
            if x < sx {
                sx = x;
            }
            if x > ex {
                ex = x;
            }
            if y < sy {
                sy = y;
            }
            if y > ey {
                ey = y;
            }
        }
    }
    if sx > ex || sy > ey {
        None
    } else {
        Some((sx, sy, ex, ey))
    }
}

fn empty_image(scale: u32) -> SourceImage {
    SourceImage {
        pixels: vec![],
        width: 0,
        height: 0,
        xoff: 0,
        yoff: 0,
        scale,
    }
}

#[inline]
fn premultiply_channel(v: u32, a: u32) -> u32 {
    (v * 255 / a).min(255)
}

/// Decode a natively scaled (high-res tier) asset. The trim box is snapped
/// outward to multiples of the display scale so unscaled pixel boundaries
/// stay aligned; dimensions and offsets are reduced back to base units.
fn load_native(raw: &RawPixels, scale: u32) -> SourceImage {
    let (rw, rh) = raw.dims();
    let Some((sx, sy, ex, ey)) = trim_bounds(raw) else {
        return empty_image(scale);
    };

    let sx = (sx / scale) * scale;
    let sy = (sy / scale) * scale;
    let ex = ((ex + scale) / scale) * scale;
    let ey = ((ey + scale) / scale) * scale;

    let sw = ex - sx;
    let sh = ey - sy;
    let xoff = -((rw / 2) as i32) + sx as i32;
    let yoff = -((rh / 2) as i32) + sy as i32;

    let mut pixels = vec![0u32; (sw * sh) as usize];
    for y in 0..sh {
        for x in 0..sw {
            let (mut r, mut g, mut b, a) = if sx + x >= rw || sy + y >= rh {
                (0, 0, 0, 0)
            } else {
                raw.rgba(sx + x, sy + y)
            };
            if a != 0 {
                r = premultiply_channel(r, a);
                g = premultiply_channel(g, a);
                b = premultiply_channel(b, a);
            } else {
                r = 0;
                g = 0;
                b = 0;
            }
            pixels[(x + y * sw) as usize] = effects::argb(r, g, b, a);
        }
    }

    SourceImage {
        pixels,
        width: (sw / scale) as u16,
        height: (sh / scale) as u16,
        xoff: (xoff / scale as i32) as i16,
        yoff: (yoff / scale as i32) as i16,
        scale,
    }
}

/// Decode a low-res asset and up-scale it by pixel replication. Smoothing
/// (when requested) runs on the straight-alpha pixels, then the whole
/// buffer is premultiplied.
fn load_scaled(raw: &RawPixels, scale: u32, smooth: bool) -> SourceImage {
    let (rw, rh) = raw.dims();
    let Some((sx, sy, ex, ey)) = trim_bounds(raw) else {
        return empty_image(scale);
    };

    let w = ex - sx + 1;
    let h = ey - sy + 1;
    let xoff = -((rw / 2) as i32) + sx as i32;
    let yoff = -((rh / 2) as i32) + sy as i32;

    let sw = w * scale;
    let sh = h * scale;
    let mut pixels = vec![0u32; (sw * sh) as usize];
    for y in 0..h {
        for x in 0..w {
            let (r, g, b, a) = raw.rgba(sx + x, sy + y);
            let c = if a == 0 {
                0
            } else {
                effects::argb(r, g, b, a)
            };
            for dy in 0..scale {
                for dx in 0..scale {
                    pixels[(x * scale + dx + (y * scale + dy) * sw) as usize] = c;
                }
            }
        }
    }

    if scale > 1 && smooth {
        smoothify(&mut pixels, sw as usize, sh as usize, scale);
    }
    premultiply(&mut pixels);

    SourceImage {
        pixels,
        width: w as u16,
        height: h as u16,
        xoff: xoff as i16,
        yoff: yoff as i16,
        scale,
    }
}

/// Blend the corners of each replicated block with its right and bottom
/// neighbors. Operates on straight-alpha pixels.
pub fn smoothify(pixels: &mut [u32], xres: usize, yres: usize, scale: u32) {
    use effects::mix_argb as mix;
    let s = scale as usize;
    match scale {
        2 => {
            let mut x = 0;
            while x + 2 < xres {
                let mut y = 0;
                while y + 2 < yres {
                    let c1 = pixels[x + y * xres];
                    let c2 = pixels[x + y * xres + 2];
                    let c3 = pixels[x + y * xres + xres * 2];
                    let c4 = pixels[x + y * xres + 2 + xres * 2];

                    pixels[x + y * xres + 1] = mix(c1, c2, 0.5, 0.5);
                    pixels[x + y * xres + xres] = mix(c1, c3, 0.5, 0.5);
                    pixels[x + y * xres + 1 + xres] =
                        mix(mix(c1, c2, 0.5, 0.5), mix(c3, c4, 0.5, 0.5), 0.5, 0.5);
                    y += s;
                }
                x += s;
            }
        }
        3 => {
            let mut x = 0;
            while x + 3 < xres {
                let mut y = 0;
                while y + 3 < yres {
                    let c1 = pixels[x + y * xres];
                    let c2 = pixels[x + y * xres + 3];
                    let c3 = pixels[x + y * xres + xres * 3];
                    let c4 = pixels[x + y * xres + 3 + xres * 3];

                    pixels[x + y * xres + 1] = mix(c1, c2, 0.667, 0.333);
                    pixels[x + y * xres + 2] = mix(c1, c2, 0.333, 0.667);

                    pixels[x + y * xres + xres] = mix(c1, c3, 0.667, 0.333);
                    pixels[x + y * xres + xres * 2] = mix(c1, c3, 0.333, 0.667);

                    pixels[x + y * xres + 1 + xres] =
                        mix(mix(c1, c2, 0.5, 0.5), mix(c3, c4, 0.5, 0.5), 0.5, 0.5);
                    pixels[x + y * xres + 2 + xres] =
                        mix(mix(c1, c2, 0.333, 0.667), mix(c3, c4, 0.333, 0.667), 0.667, 0.333);
                    pixels[x + y * xres + 1 + xres * 2] =
                        mix(mix(c1, c2, 0.667, 0.333), mix(c3, c4, 0.667, 0.333), 0.333, 0.667);
                    pixels[x + y * xres + 2 + xres * 2] =
                        mix(mix(c1, c2, 0.333, 0.667), mix(c3, c4, 0.333, 0.667), 0.333, 0.667);
                    y += s;
                }
                x += s;
            }
        }
        4 => {
            let mut x = 0;
            while x + 4 < xres {
                let mut y = 0;
                while y + 4 < yres {
                    let c1 = pixels[x + y * xres];
                    let c2 = pixels[x + y * xres + 4];
                    let c3 = pixels[x + y * xres + xres * 4];
                    let c4 = pixels[x + y * xres + 4 + xres * 4];

                    pixels[x + y * xres + 1] = mix(c1, c2, 0.75, 0.25);
                    pixels[x + y * xres + 2] = mix(c1, c2, 0.5, 0.5);
                    pixels[x + y * xres + 3] = mix(c1, c2, 0.25, 0.75);

                    pixels[x + y * xres + xres] = mix(c1, c3, 0.75, 0.25);
                    pixels[x + y * xres + xres * 2] = mix(c1, c3, 0.5, 0.5);
                    pixels[x + y * xres + xres * 3] = mix(c1, c3, 0.25, 0.75);

                    pixels[x + y * xres + 1 + xres] =
                        mix(mix(c1, c2, 0.75, 0.25), mix(c3, c4, 0.75, 0.25), 0.75, 0.25);
                    pixels[x + y * xres + 1 + xres * 2] =
                        mix(mix(c1, c2, 0.75, 0.25), mix(c3, c4, 0.75, 0.25), 0.5, 0.5);
                    pixels[x + y * xres + 1 + xres * 3] =
                        mix(mix(c1, c2, 0.75, 0.75), mix(c3, c4, 0.75, 0.25), 0.25, 0.75);

                    pixels[x + y * xres + 2 + xres] =
                        mix(mix(c1, c2, 0.5, 0.5), mix(c3, c4, 0.5, 0.5), 0.75, 0.25);
                    pixels[x + y * xres + 2 + xres * 2] =
                        mix(mix(c1, c2, 0.5, 0.5), mix(c3, c4, 0.5, 0.5), 0.5, 0.5);
                    pixels[x + y * xres + 2 + xres * 3] =
                        mix(mix(c1, c2, 0.5, 0.5), mix(c3, c4, 0.5, 0.5), 0.25, 0.75);

                    pixels[x + y * xres + 3 + xres] =
                        mix(mix(c1, c2, 0.25, 0.75), mix(c3, c4, 0.25, 0.75), 0.75, 0.25);
                    pixels[x + y * xres + 3 + xres * 2] =
                        mix(mix(c1, c2, 0.25, 0.75), mix(c3, c4, 0.25, 0.75), 0.5, 0.5);
                    pixels[x + y * xres + 3 + xres * 3] =
                        mix(mix(c1, c2, 0.25, 0.75), mix(c3, c4, 0.25, 0.75), 0.25, 0.75);
                    y += s;
                }
                x += s;
            }
        }
        _ => {
            warn!("unsupported scale {} in smoothify", scale);
        }
    }
}

/// Premultiply every pixel in place.
pub fn premultiply(pixels: &mut [u32]) {
    for p in pixels.iter_mut() {
        let c = *p;
        let a = effects::get_a(c);
        if a == 0 {
            continue;
        }
        let r = premultiply_channel(effects::get_r(c), a);
        let g = premultiply_channel(effects::get_g(c), a);
        let b = premultiply_channel(effects::get_b(c), a);
        *p = effects::argb(r, g, b, a);
    }
}

/// Walk the archive tiers in priority order and decode the first usable
/// asset. Corrupt data in one archive falls through to the next.
fn load_sprite(
    sprite: u32,
    archives: &ArchiveSet,
    scale: u32,
    traits: SpriteTraits,
) -> Result<SourceImage, DecodeError> {
    let name = sprite_filename(sprite);
    let mut last_err = DecodeError::NotFound;

    for archive in archives.high.iter() {
        if let Some(data) = archive.read(&name) {
            match decode_raw(&data) {
                Ok(raw) => return Ok(load_native(&raw, scale)),
                Err(e) => {
                    warn!("{} in {}: {}", name, archive.label(), e);
                    last_err = e;
                }
            }
        }
    }

    for archive in archives.low.iter() {
        if let Some(data) = archive.read(&name) {
            match decode_raw(&data) {
                Ok(raw) => return Ok(load_scaled(&raw, scale, traits.smooth)),
                Err(e) => {
                    warn!("{} in {}: {}", name, archive.label(), e);
                    last_err = e;
                }
            }
        }
    }

    Err(last_err)
}

// per-sprite load states
const IMG_UNLOADED: u8 = 0;
const IMG_LOADING: u8 = 1;
const IMG_READY: u8 = 2;
const IMG_FAILED: u8 = 3;

struct ImageEntry {
    state: AtomicU8,
    image: Mutex<Option<Arc<SourceImage>>>,
}

/// Decoded-image table, one entry per sprite id. Images are created on
/// first reference and stay resident until the store drops; slots that get
/// evicted do not release them.
pub struct ImageStore {
    entries: Vec<ImageEntry>,
    stats: Arc<RenderStats>,
}

impl ImageStore {
    pub fn new(stats: Arc<RenderStats>) -> Self {
        let mut entries = Vec::with_capacity(MAX_SPRITE as usize);
        for _ in 0..MAX_SPRITE {
            entries.push(ImageEntry {
                state: AtomicU8::new(IMG_UNLOADED),
                image: Mutex::new(None),
            });
        }
        Self { entries, stats }
    }

    /// The decoded image if it is ready; never triggers a load.
    pub fn get(&self, sprite: u32) -> Option<Arc<SourceImage>> {
        let entry = self.entries.get(sprite as usize)?;
        if entry.state.load(Ordering::Acquire) != IMG_READY {
            return None;
        }
        entry.image.lock().unwrap().clone()
    }

    /// Decode the sprite if needed and return its image. Races are
    /// resolved through the per-sprite state machine: one caller decodes,
    /// the others wait for the published result. A sprite that no archive
    /// provides is published as the placeholder image, so the archives are
    /// probed only once per id.
    pub fn load(
        &self,
        sprite: u32,
        archives: &ArchiveSet,
        scale: u32,
        classifier: &dyn SpriteClassifier,
    ) -> Result<Arc<SourceImage>, ImageError> {
        let entry = match self.entries.get(sprite as usize) {
            Some(e) => e,
            None => {
                warn!("illegal sprite {} wanted in image load", sprite);
                return Err(ImageError::IllegalSprite(sprite));
            }
        };

        loop {
            match entry.state.load(Ordering::Acquire) {
                IMG_READY => {
                    if let Some(img) = entry.image.lock().unwrap().clone() {
                        return Ok(img);
                    }
                    return Err(ImageError::GraphicsMissing);
                }
                IMG_FAILED => return Err(ImageError::GraphicsMissing),
                IMG_LOADING => {
                    // someone else is decoding; wait for them
                    std::thread::sleep(Duration::from_millis(1));
                }
                _ => {
                    if entry
                        .state
                        .compare_exchange(
                            IMG_UNLOADED,
                            IMG_LOADING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        // we won the race and are the loader now
        let traits = classifier.traits(sprite);
        let decoded = match load_sprite(sprite, archives, scale, traits) {
            Ok(img) => Some(img),
            Err(e) => {
                warn!("{}: {}", sprite_filename(sprite), e);
                // terminal fallback: the placeholder from the base archive
                self.load_placeholder(archives, scale, traits)
            }
        };

        match decoded {
            Some(img) => {
                self.stats.add_image_bytes(img.byte_size() as i64);
                let img = Arc::new(img);
                *entry.image.lock().unwrap() = Some(img.clone());
                entry.state.store(IMG_READY, Ordering::Release);
                Ok(img)
            }
            None => {
                entry.state.store(IMG_FAILED, Ordering::Release);
                error!("placeholder sprite unavailable, graphics install is broken");
                Err(ImageError::GraphicsMissing)
            }
        }
    }

    fn load_placeholder(
        &self,
        archives: &ArchiveSet,
        scale: u32,
        traits: SpriteTraits,
    ) -> Option<SourceImage> {
        let base = archives.low.base.as_deref()?;
        let data = base.read(&sprite_filename(PLACEHOLDER_SPRITE))?;
        match decode_raw(&data) {
            Ok(raw) => Some(load_scaled(&raw, scale, traits.smooth)),
            Err(e) => {
                warn!("placeholder decode failed: {}", e);
                None
            }
        }
    }
}

/// Output geometry of a slot: the fingerprint's percent rescale applied to
/// the source dimensions, plus any classifier size adjustment.
pub fn output_geometry(fx: &SpriteFx, si: &SourceImage, traits: SpriteTraits) -> SlotGeometry {
    let mut scale: i32 = if si.width == 0 || si.height == 0 {
        100
    } else {
        fx.scale as i32
    };
    if traits.scale_pct != 100 {
        scale = (scale as f64 * traits.scale_pct as f64 / 100.0) as i32;
    }

    if scale != 100 {
        SlotGeometry {
            width: ((si.width as i32 - 1) as f64 * scale as f64 / 100.0).ceil() as u16,
            height: ((si.height as i32 - 1) as f64 * scale as f64 / 100.0).ceil() as u16,
            xoff: (si.xoff as f64 * scale as f64 / 100.0 + 0.5).floor() as i16,
            yoff: (si.yoff as f64 * scale as f64 / 100.0 + 0.5).floor() as i16,
            scale: scale as u32,
        }
    } else {
        SlotGeometry {
            width: si.width,
            height: si.height,
            xoff: si.xoff,
            yoff: si.yoff,
            scale: 100,
        }
    }
}

/// Stage 2: fill the slot's staging buffer from the source image, applying
/// the fingerprint's effects. `out` must hold
/// `geom.width * geom.height * si.scale^2` pixels.
pub fn compose(fx: &SpriteFx, si: &SourceImage, geom: &SlotGeometry, mode: LightMode, out: &mut [u32]) {
    let ds = si.scale; // display scale
    let dw = geom.width as usize * ds as usize;
    let dh = geom.height as usize * ds as usize;
    debug_assert_eq!(out.len(), dw * dh);

    let scale = geom.scale as i32;
    let sw = si.width as i32 * ds as i32;
    let sh = si.height as i32 * ds as i32;

    let sink = if fx.sink != 0 {
        (fx.sink as i32).min((geom.height as i32 - 4).max(0))
    } else {
        0
    };

    let colorized = fx.c1 != 0 || fx.c2 != 0 || fx.c3 != 0;
    let sample = |x: i32, y: i32| -> u32 {
        let c = si.pixels[(x + y * sw) as usize];
        if colorized {
            effects::colorize_xy(c, fx.c1, fx.c2, fx.c3, x, y, sw, sh, &si.pixels, fx.sprite, ds)
        } else {
            c
        }
    };

    for y in 0..dh as i32 {
        for x in 0..dw as i32 {
            let mut c;

            if scale != 100 {
                let mut ix = x as f64 * 100.0 / scale as f64;
                let mut iy = y as f64 * 100.0 / scale as f64;

                if ix.ceil() >= sw as f64 {
                    ix = sw as f64 - 1.001;
                }
                if iy.ceil() >= sh as f64 {
                    iy = sh as f64 - 1.001;
                }

                let high_x = ix - ix.floor();
                let high_y = iy - iy.floor();
                let low_x = 1.0 - high_x;
                let low_y = 1.0 - high_y;

                let (x0, y0) = (ix.floor() as i32, iy.floor() as i32);
                let (x1, y1) = (ix.ceil() as i32, iy.ceil() as i32);

                let mut a;
                let mut r;
                let mut g;
                let mut b;

                let p = sample(x0, y0);
                a = effects::get_a(p) as f64 * low_x * low_y;
                r = effects::get_r(p) as f64 * low_x * low_y;
                g = effects::get_g(p) as f64 * low_x * low_y;
                b = effects::get_b(p) as f64 * low_x * low_y;

                let p = sample(x1, y0);
                a += effects::get_a(p) as f64 * high_x * low_y;
                r += effects::get_r(p) as f64 * high_x * low_y;
                g += effects::get_g(p) as f64 * high_x * low_y;
                b += effects::get_b(p) as f64 * high_x * low_y;

                let p = sample(x0, y1);
                a += effects::get_a(p) as f64 * low_x * high_y;
                r += effects::get_r(p) as f64 * low_x * high_y;
                g += effects::get_g(p) as f64 * low_x * high_y;
                b += effects::get_b(p) as f64 * low_x * high_y;

                let p = sample(x1, y1);
                a += effects::get_a(p) as f64 * high_x * high_y;
                r += effects::get_r(p) as f64 * high_x * high_y;
                g += effects::get_g(p) as f64 * high_x * high_y;
                b += effects::get_b(p) as f64 * high_x * high_y;

                c = effects::argb(r as u32, g as u32, b as u32, a as u32);
            } else {
                c = sample(x, y);
            }

            if fx.cr != 0 || fx.cg != 0 || fx.cb != 0 || fx.light != 0 || fx.sat != 0 {
                c = effects::color_balance(
                    c,
                    fx.cr as i8 as i32,
                    fx.cg as i8 as i32,
                    fx.cb as i8 as i32,
                    fx.light as i8 as i32,
                    fx.sat as i8 as i32,
                );
            }

            // Shaded lighting: when adjacent tiles are lit differently,
            // blend five lit variants with weights from the pixel's
            // position relative to the sprite center.
            if fx.ll != fx.ml || fx.rl != fx.ml || fx.ul != fx.ml || fx.dl != fx.ml {
                let half_w = dw as i32 / 2;
                let half_h = dh as i32 / 2;

                let wl = if x < half_w { half_w - x } else { 0 };
                let wr = if x >= half_w { x - half_w } else { 0 };
                let wu = if y < half_h { half_h - y } else { 0 };
                let wd = if y >= half_h { y - half_h } else { 0 };
                let mut wm = half_w + half_h - (wl + wr + wu + wd) / 2;
                if wm < half_w / 2 {
                    wm = half_w / 2;
                }

                let div = wm + wl + wr + wu + wd;

                c = if div == 0 {
                    0
                } else {
                    let lit_m = effects::light_with(fx.ml as i32, c, mode);
                    let lit_l = effects::light_with(fx.ll as i32, c, mode);
                    let lit_r = effects::light_with(fx.rl as i32, c, mode);
                    let lit_u = effects::light_with(fx.ul as i32, c, mode);
                    let lit_d = effects::light_with(fx.dl as i32, c, mode);

                    let blend = |f: fn(u32) -> u32| -> u32 {
                        ((f(lit_m) as i32 * wm
                            + f(lit_l) as i32 * wl
                            + f(lit_r) as i32 * wr
                            + f(lit_u) as i32 * wu
                            + f(lit_d) as i32 * wd)
                            / div) as u32
                    };

                    effects::argb(
                        blend(effects::get_r),
                        blend(effects::get_g),
                        blend(effects::get_b),
                        effects::get_a(c),
                    )
                };
            } else {
                c = effects::light_with(fx.ml as i32, c, mode);
            }

            // shine after lighting, for a uniform highlight
            if fx.shine != 0 {
                c = effects::shine(c, fx.shine);
            }

            if sink != 0 && (geom.height as i32) * ds as i32 - sink * (ds as i32) < y {
                c &= 0x00ff_ffff; // zero alpha, keep color
            }

            if fx.freeze != 0 {
                c = effects::freeze(fx.freeze as i32, c);
            }

            out[(x + y * dw as i32) as usize] = c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveTier, MemArchive};
    use crate::classify;
    use crate::effects::argb;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_rgba(img: RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn png_rgb(img: RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn solid_sprite_png(w: u32, h: u32, color: Rgba<u8>) -> Vec<u8> {
        png_rgba(RgbaImage::from_pixel(w, h, color))
    }

    fn archives_with_base(files: Vec<(u32, Vec<u8>)>) -> ArchiveSet {
        let mut base = MemArchive::new("base");
        for (sprite, data) in files {
            base.insert(&sprite_filename(sprite), data);
        }
        ArchiveSet::from_tiers(
            ArchiveTier::default(),
            ArchiveTier {
                modded: None,
                patch: None,
                base: Some(Box::new(base)),
            },
        )
    }

    #[test]
    fn trims_to_visible_box_and_centers_offset() {
        // 8x8, opaque 3x3 block at (2,3)
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
        for y in 3..6 {
            for x in 2..5 {
                img.put_pixel(x, y, Rgba([10, 20, 30, 255]));
            }
        }
        let raw = decode_raw(&png_rgba(img)).unwrap();
        let si = load_scaled(&raw, 1, false);
        assert_eq!((si.width, si.height), (3, 3));
        assert_eq!((si.xoff, si.yoff), (-2, -1));
        assert_eq!(si.pixels[0], argb(10, 20, 30, 255));
    }

    #[test]
    fn magenta_is_transparent() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 255]));
        img.put_pixel(1, 1, Rgb([50, 60, 70]));
        let raw = decode_raw(&png_rgb(img)).unwrap();
        let si = load_scaled(&raw, 1, false);
        assert_eq!((si.width, si.height), (1, 1));
        assert_eq!(si.pixels[0], argb(50, 60, 70, 255));
    }

    #[test]
    fn fully_keyed_image_decodes_empty() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 255]));
        let raw = decode_raw(&png_rgb(img)).unwrap();
        let si = load_scaled(&raw, 2, true);
        assert_eq!((si.width, si.height), (0, 0));
        assert!(si.pixels.is_empty());
    }

    #[test]
    fn upscale_replicates_blocks() {
        let img = RgbaImage::from_pixel(2, 1, Rgba([100, 0, 0, 255]));
        let raw = decode_raw(&png_rgba(img)).unwrap();
        let si = load_scaled(&raw, 2, false);
        assert_eq!((si.width, si.height), (2, 1));
        assert_eq!(si.pixels.len(), 8);
        assert!(si.pixels.iter().all(|&p| p == argb(100, 0, 0, 255)));
    }

    #[test]
    fn premultiply_amplifies_by_alpha() {
        let mut pixels = vec![argb(100, 50, 0, 128)];
        premultiply(&mut pixels);
        assert_eq!(pixels[0], argb(199, 99, 0, 128));
    }

    #[test]
    fn native_trim_snaps_to_scale_multiples() {
        // 8x8 at scale 2, single visible pixel at (3,3): box snaps to (2,2)-(4,4)
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
        img.put_pixel(3, 3, Rgba([255, 255, 255, 255]));
        let raw = decode_raw(&png_rgba(img)).unwrap();
        let si = load_native(&raw, 2);
        assert_eq!((si.width, si.height), (1, 1));
        assert_eq!((si.xoff, si.yoff), (-1, -1));
        assert_eq!(si.pixels.len(), 4);
    }

    #[test]
    fn store_prefers_mod_archive() {
        let mut modded = MemArchive::new("mod");
        modded.insert(&sprite_filename(7), solid_sprite_png(2, 2, Rgba([0, 255, 0, 255])));
        let mut base = MemArchive::new("base");
        base.insert(&sprite_filename(7), solid_sprite_png(2, 2, Rgba([255, 0, 0, 255])));
        let archives = ArchiveSet::from_tiers(
            ArchiveTier::default(),
            ArchiveTier {
                modded: Some(Box::new(modded)),
                patch: None,
                base: Some(Box::new(base)),
            },
        );
        let store = ImageStore::new(Arc::new(RenderStats::new()));
        let img = store.load(7, &archives, 1, classify::builtin()).unwrap();
        assert_eq!(img.pixels[0], argb(0, 255, 0, 255));
    }

    #[test]
    fn missing_sprite_falls_back_to_placeholder() {
        let archives = archives_with_base(vec![(
            PLACEHOLDER_SPRITE,
            solid_sprite_png(2, 2, Rgba([1, 2, 3, 255])),
        )]);
        let store = ImageStore::new(Arc::new(RenderStats::new()));
        let img = store.load(4242, &archives, 1, classify::builtin()).unwrap();
        assert_eq!(img.pixels[0], argb(1, 2, 3, 255));
        // published under the requested id: second call hits the ready state
        assert!(store.get(4242).is_some());
    }

    #[test]
    fn broken_install_is_fatal() {
        let archives = archives_with_base(vec![]);
        let store = ImageStore::new(Arc::new(RenderStats::new()));
        match store.load(4242, &archives, 1, classify::builtin()) {
            Err(ImageError::GraphicsMissing) => {}
            other => panic!("expected GraphicsMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn corrupt_archive_entry_falls_through() {
        let mut modded = MemArchive::new("mod");
        modded.insert(&sprite_filename(9), vec![0xde, 0xad, 0xbe, 0xef]);
        let mut base = MemArchive::new("base");
        base.insert(&sprite_filename(9), solid_sprite_png(1, 1, Rgba([9, 9, 9, 255])));
        let archives = ArchiveSet::from_tiers(
            ArchiveTier::default(),
            ArchiveTier {
                modded: Some(Box::new(modded)),
                patch: None,
                base: Some(Box::new(base)),
            },
        );
        let store = ImageStore::new(Arc::new(RenderStats::new()));
        let img = store.load(9, &archives, 1, classify::builtin()).unwrap();
        assert_eq!(img.pixels[0], argb(9, 9, 9, 255));
    }

    fn test_image(w: u16, h: u16, color: u32) -> SourceImage {
        SourceImage {
            pixels: vec![color; w as usize * h as usize],
            width: w,
            height: h,
            xoff: 0,
            yoff: 0,
            scale: 1,
        }
    }

    #[test]
    fn compose_full_bright_is_identity() {
        let si = test_image(4, 4, argb(12, 34, 56, 255));
        let fx = SpriteFx::new(1);
        let geom = output_geometry(&fx, &si, SpriteTraits::default());
        assert_eq!((geom.width, geom.height), (4, 4));
        let mut out = vec![0u32; 16];
        compose(&fx, &si, &geom, LightMode::Standard, &mut out);
        assert_eq!(out, si.pixels);
    }

    #[test]
    fn compose_sink_cuts_bottom_rows() {
        let si = test_image(4, 8, argb(200, 200, 200, 255));
        let mut fx = SpriteFx::new(1);
        fx.sink = 10; // clamps to height - 4
        let geom = output_geometry(&fx, &si, SpriteTraits::default());
        let mut out = vec![0u32; 32];
        compose(&fx, &si, &geom, LightMode::Standard, &mut out);
        // rows below height - sink lose their alpha
        for y in 0..8usize {
            for x in 0..4usize {
                let a = effects::get_a(out[x + y * 4]);
                if y as i32 > 8 - 4 {
                    assert_eq!(a, 0, "row {} should be cut", y);
                } else {
                    assert_eq!(a, 255, "row {} should be solid", y);
                }
            }
        }
    }

    #[test]
    fn compose_directional_light_grades_toward_dark_edge() {
        let si = test_image(8, 8, argb(200, 200, 200, 255));
        let mut fx = SpriteFx::new(1);
        fx.ml = 15;
        fx.ll = 5;
        fx.rl = 15;
        fx.ul = 15;
        fx.dl = 15;
        let geom = output_geometry(&fx, &si, SpriteTraits::default());
        let mut out = vec![0u32; 64];
        compose(&fx, &si, &geom, LightMode::Standard, &mut out);
        let left = effects::get_r(out[8 * 4]);
        let right = effects::get_r(out[8 * 4 + 7]);
        assert!(left < right, "left edge must be darker ({} vs {})", left, right);
    }

    #[test]
    fn geometry_rescales_by_percent() {
        let si = test_image(10, 10, argb(1, 1, 1, 255));
        let mut fx = SpriteFx::new(1);
        fx.scale = 50;
        let geom = output_geometry(&fx, &si, SpriteTraits::default());
        assert_eq!((geom.width, geom.height), (5, 5));
        assert_eq!(geom.scale, 50);

        // classifier size adjustment compounds
        let traits = SpriteTraits {
            smooth: true,
            scale_pct: 88,
        };
        let geom = output_geometry(&fx, &si, traits);
        assert_eq!(geom.scale, 44);
    }

    #[test]
    fn compose_rescale_downsamples() {
        let si = test_image(10, 10, argb(80, 80, 80, 255));
        let mut fx = SpriteFx::new(1);
        fx.scale = 50;
        let geom = output_geometry(&fx, &si, SpriteTraits::default());
        let mut out = vec![0u32; geom.width as usize * geom.height as usize];
        compose(&fx, &si, &geom, LightMode::Standard, &mut out);
        // uniform source stays uniform through bilinear sampling
        assert!(out.iter().all(|&p| p == argb(80, 80, 80, 255)));
    }
}
