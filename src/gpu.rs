// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! The renderer seam. The cache core never talks to a concrete graphics
//! API; stage 3 hands finished pixels to whatever implements [`Gpu`] and
//! stores the returned handle in the slot. Dropping the handle releases
//! the texture.
//!
//! Only the main thread drives uploads (stage 3 and the foreground path),
//! so implementations do not need to be thread-safe; the handles travel
//! between threads inside the cache and must be `Send`.
//!
//! [`SoftGpu`] is the software implementation used by tests and headless
//! runs: textures are plain pixel buffers.

#[derive(Debug)]
pub enum GpuError {
    CreateFailed(String),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::CreateFailed(msg) => write!(f, "texture creation failed: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {}

pub trait Gpu {
    type Texture: Send + 'static;

    /// Build a static ARGB8888 texture from premultiplied pixels.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<Self::Texture, GpuError>;

    /// Per-blit alpha modulation.
    fn set_texture_alpha(&mut self, texture: &mut Self::Texture, alpha: u8);
}

/// Software texture: the pixels, kept.
pub struct SoftTexture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
    pub alpha_mod: u8,
}

/// Software backend. Counts creations so tests can assert that hits do no
/// recomposition work.
#[derive(Default)]
pub struct SoftGpu {
    pub created: usize,
}

impl SoftGpu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gpu for SoftGpu {
    type Texture = SoftTexture;

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<SoftTexture, GpuError> {
        if pixels.len() != (width * height) as usize {
            return Err(GpuError::CreateFailed(format!(
                "pixel buffer is {} but texture is {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        self.created += 1;
        Ok(SoftTexture {
            width,
            height,
            pixels: pixels.to_vec(),
            alpha_mod: 255,
        })
    }

    fn set_texture_alpha(&mut self, texture: &mut SoftTexture, alpha: u8) {
        texture.alpha_mod = alpha;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_gpu_validates_dimensions() {
        let mut gpu = SoftGpu::new();
        assert!(gpu.create_texture(2, 2, &[0; 3]).is_err());
        let tex = gpu.create_texture(2, 2, &[0; 4]).unwrap();
        assert_eq!((tex.width, tex.height), (2, 2));
        assert_eq!(gpu.created, 1);
    }
}
