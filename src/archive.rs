// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Read-only graphics archives. The decoder never touches the filesystem
//! directly; it reads named blobs through the [`Archive`] trait so the
//! asset layer stays an external, swappable dependency.
//!
//! An archive set groups the mod/patch/base handles of both resolution
//! tiers. Priority when several archives provide the same sprite:
//! mod > patch > base, native high-res tier before the upscaled low-res
//! tier.

use crate::config::RenderConfig;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;

pub trait Archive: Send + Sync {
    /// Read a named blob, `None` if the archive does not contain it.
    fn read(&self, name: &str) -> Option<Vec<u8>>;
    fn label(&self) -> &str;
}

/// Archive file name of a sprite.
pub fn sprite_filename(sprite: u32) -> String {
    format!("{:08}.png", sprite)
}

/// A directory of loose files, opened read-only at startup.
pub struct DirArchive {
    root: PathBuf,
    label: String,
}

impl DirArchive {
    /// Returns `None` when the directory is absent; patch and mod archives
    /// are optional installs.
    pub fn open(root: PathBuf) -> Option<Self> {
        if !root.is_dir() {
            return None;
        }
        let label = root.to_string_lossy().into_owned();
        info!("archive open: {}", label);
        Some(Self { root, label })
    }
}

impl Archive for DirArchive {
    fn read(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(name)).ok()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// In-memory archive for tests and embedded assets.
#[derive(Default)]
pub struct MemArchive {
    label: String,
    files: HashMap<String, Vec<u8>>,
}

impl MemArchive {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            files: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }
}

impl Archive for MemArchive {
    fn read(&self, name: &str) -> Option<Vec<u8>> {
        self.files.get(name).cloned()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// The mod/patch/base handles of one resolution tier.
#[derive(Default)]
pub struct ArchiveTier {
    pub modded: Option<Box<dyn Archive>>,
    pub patch: Option<Box<dyn Archive>>,
    pub base: Option<Box<dyn Archive>>,
}

impl ArchiveTier {
    /// Handles in lookup priority order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Archive> {
        [&self.modded, &self.patch, &self.base]
            .into_iter()
            .filter_map(|a| a.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.modded.is_none() && self.patch.is_none() && self.base.is_none()
    }
}

pub struct ArchiveSet {
    /// Native assets for display scales 2..=4. Empty at scale 1.
    pub high: ArchiveTier,
    /// 1x assets, upscaled by the decoder.
    pub low: ArchiveTier,
}

impl ArchiveSet {
    pub fn from_tiers(high: ArchiveTier, low: ArchiveTier) -> Self {
        Self { high, low }
    }

    /// Open the archive directories under the configured resource root:
    /// gx1 / gx1_patch / gx1_mod always, plus gx{scale} variants when the
    /// display scale has a native tier.
    pub fn open(cfg: &RenderConfig) -> Self {
        let dir = |name: String| -> Option<Box<dyn Archive>> {
            DirArchive::open(cfg.res_dir.join(name)).map(|a| Box::new(a) as Box<dyn Archive>)
        };

        let low = ArchiveTier {
            modded: dir("gx1_mod".to_string()),
            patch: dir("gx1_patch".to_string()),
            base: dir("gx1".to_string()),
        };

        let high = if cfg.scale > 1 {
            ArchiveTier {
                modded: dir(format!("gx{}_mod", cfg.scale)),
                patch: dir(format!("gx{}_patch", cfg.scale)),
                base: dir(format!("gx{}", cfg.scale)),
            }
        } else {
            ArchiveTier::default()
        };

        Self { high, low }
    }
}
