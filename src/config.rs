// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Startup configuration. Values are read once (from a TOML file or the
//! defaults) and are immutable afterwards; changing the cache size, the
//! display scale or the worker count at runtime would require a full cache
//! teardown and is not supported.

use crate::effects::LightMode;
use log::info;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Number of texture cache slots.
    pub cache_size: usize,
    /// Display upscale factor, 1..=4. Also selects the high-res archive tier.
    pub scale: u32,
    /// Background worker threads. 0 runs every pipeline stage on the caller.
    pub workers: usize,
    /// Lighting curve.
    pub light_mode: LightMode,
    /// Root directory holding the graphics archives (gx1, gx1_patch, ...).
    pub res_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            cache_size: 8000,
            scale: 1,
            workers: 0,
            light_mode: LightMode::Standard,
            res_dir: PathBuf::from("res"),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> ConfigError {
        ConfigError::Parse(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RenderConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let cfg: RenderConfig = toml::from_str(&data)?;
        cfg.validate()?;
        info!(
            "render config: cache_size={} scale={} workers={}",
            cfg.cache_size, cfg.scale, cfg.workers
        );
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=4).contains(&self.scale) {
            return Err(ConfigError::Invalid(format!(
                "scale must be 1..=4, got {}",
                self.scale
            )));
        }
        if self.cache_size < 16 {
            return Err(ConfigError::Invalid(format!(
                "cache_size must be at least 16, got {}",
                self.cache_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RenderConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_toml() {
        let cfg: RenderConfig =
            toml::from_str("cache_size = 4000\nscale = 2\nworkers = 3\nlight_mode = \"lighter\"")
                .unwrap();
        assert_eq!(cfg.cache_size, 4000);
        assert_eq!(cfg.scale, 2);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.light_mode, LightMode::Lighter);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_scale() {
        let cfg = RenderConfig {
            scale: 5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
