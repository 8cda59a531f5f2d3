// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Text rasterization for text-fingerprint cache slots.
//!
//! Text never rides the prefetch pipeline: a reserved text slot is
//! rasterized and uploaded inline at lookup time. Glyph coverage comes
//! from fontdue; the coverage value becomes the pixel's alpha, the
//! fingerprint's color its RGB. Shaded text draws a black drop shadow
//! first, framed text a black outline; both widen the buffer by two
//! scaled pixels, matching the blit metrics of the plain variant.

use bitflags::bitflags;
use fontdue::{Font, FontSettings};
use log::warn;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextStyle: u16 {
        const SHADED = 1 << 0;
        const FRAMED = 1 << 1;
    }
}

/// A font plus the pixel size it renders at.
pub struct FontHandle {
    font: Font,
    px: f32,
}

/// Registered fonts, addressed by the small integer id stored in text
/// fingerprints.
#[derive(Default)]
pub struct FontStore {
    fonts: Vec<FontHandle>,
}

impl FontStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, data: &[u8], px: f32) -> Result<u16, String> {
        let font = Font::from_bytes(data, FontSettings::default()).map_err(|e| {
            warn!("font load failed: {}", e);
            e.to_string()
        })?;
        self.fonts.push(FontHandle { font, px });
        Ok((self.fonts.len() - 1) as u16)
    }

    pub fn get(&self, id: u16) -> Option<&FontHandle> {
        self.fonts.get(id as usize)
    }
}

/// Rasterized text, ready for upload.
pub struct TextPixels {
    pub pixels: Vec<u32>,
    pub width: u32,
    pub height: u32,
}

fn blit_glyph(
    out: &mut [u32],
    width: u32,
    height: u32,
    coverage: &[u8],
    gw: usize,
    gh: usize,
    x0: i32,
    y0: i32,
    color: u32,
) {
    for row in 0..gh {
        for col in 0..gw {
            let cov = coverage[col + row * gw] as u32;
            if cov == 0 {
                continue;
            }
            let x = x0 + col as i32;
            let y = y0 + row as i32;
            if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
                continue;
            }
            let a = cov * ((color >> 24) & 0xff) / 255;
            let idx = (x + y * width as i32) as usize;
            // strongest coverage wins; the main pass overprints the shadow
            if a >= (out[idx] >> 24) & 0xff {
                out[idx] = (a << 24) | (color & 0x00ff_ffff);
            }
        }
    }
}

/// Render one string into an ARGB buffer. Empty strings produce a minimal
/// 1x2 texture so the caller never deals with zero-sized uploads.
pub fn maketext(handle: &FontHandle, text: &str, color: u32, style: TextStyle, scale: u32) -> TextPixels {
    let px = handle.px * scale as f32;
    let pad = if style.intersects(TextStyle::SHADED | TextStyle::FRAMED) {
        scale as i32
    } else {
        0
    };

    if text.is_empty() {
        return TextPixels {
            pixels: vec![0; 2],
            width: 1,
            height: 2,
        };
    }

    let line = handle.font.horizontal_line_metrics(px);
    let (ascent, descent) = match line {
        Some(m) => (m.ascent, m.descent),
        None => (px, 0.0),
    };

    let mut text_w = 0f32;
    for ch in text.chars() {
        text_w += handle.font.metrics(ch, px).advance_width;
    }

    let width = (text_w.ceil() as i32 + pad * 2).max(1) as u32;
    let height = ((ascent - descent).ceil() as i32 + pad * 2 + 1).max(2) as u32;
    let mut pixels = vec![0u32; (width * height) as usize];

    let mut draw = |dx: i32, dy: i32, draw_color: u32| {
        let mut pen = 0f32;
        for ch in text.chars() {
            let (metrics, coverage) = handle.font.rasterize(ch, px);
            let x0 = pen as i32 + metrics.xmin + pad + dx;
            let y0 = ascent as i32 - metrics.height as i32 - metrics.ymin + pad + dy;
            blit_glyph(
                &mut pixels,
                width,
                height,
                &coverage,
                metrics.width,
                metrics.height,
                x0,
                y0,
                draw_color,
            );
            pen += metrics.advance_width;
        }
    };

    let s = scale as i32;
    let shadow = 0xff00_0000u32;
    if style.contains(TextStyle::FRAMED) {
        for (dx, dy) in [
            (-s, 0),
            (s, 0),
            (0, -s),
            (0, s),
            (-s, -s),
            (s, -s),
            (-s, s),
            (s, s),
        ] {
            draw(dx, dy, shadow);
        }
    } else if style.contains(TextStyle::SHADED) {
        draw(s, s, shadow);
    }
    draw(0, 0, color);

    TextPixels {
        pixels,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_font_id_is_none() {
        let store = FontStore::new();
        assert!(store.get(0).is_none());
    }

    #[test]
    fn garbage_font_data_is_rejected() {
        let mut store = FontStore::new();
        assert!(store.add(&[1, 2, 3, 4], 16.0).is_err());
    }

    #[test]
    fn style_bits_round_trip() {
        let s = TextStyle::SHADED | TextStyle::FRAMED;
        assert_eq!(TextStyle::from_bits_truncate(s.bits()), s);
    }
}
