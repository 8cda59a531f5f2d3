// RustSprite
// copyright zipxing@hotmail.com 2022～2025

//! Sprite classification. The decoder and the compose stage only ask an
//! abstract [`SpriteClassifier`] for per-sprite traits; the concrete range
//! table lives in data (JSON, same convention as the symbol map files) so
//! game-specific sprite layouts stay out of the cache core.
//!
//! Smoothing is enabled for GUI chrome, items and character sprites and
//! deliberately not for ground tiles: blending the corners of large tile
//! textures produces visible seams at tile boundaries.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Per-sprite traits consumed by the decoder and the compose stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpriteTraits {
    /// Apply the corner-blend smoothing pass after upscaling.
    pub smooth: bool,
    /// Render-size adjustment in percent (100 = unmodified).
    pub scale_pct: u32,
}

impl Default for SpriteTraits {
    fn default() -> Self {
        Self {
            smooth: false,
            scale_pct: 100,
        }
    }
}

pub trait SpriteClassifier: Send + Sync {
    fn traits(&self, sprite: u32) -> SpriteTraits;
}

fn default_scale_pct() -> u32 {
    100
}

/// One half-open id range `[from, to)` with its traits. First match wins,
/// so exclusions go before the broad ranges they carve out of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRule {
    pub from: u32,
    pub to: u32,
    #[serde(default)]
    pub smooth: bool,
    #[serde(default = "default_scale_pct")]
    pub scale_pct: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeClassifier {
    pub rules: Vec<RangeRule>,
}

impl RangeClassifier {
    pub fn new(rules: Vec<RangeRule>) -> Self {
        Self { rules }
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl SpriteClassifier for RangeClassifier {
    fn traits(&self, sprite: u32) -> SpriteTraits {
        for rule in &self.rules {
            if sprite >= rule.from && sprite < rule.to {
                return SpriteTraits {
                    smooth: rule.smooth,
                    scale_pct: rule.scale_pct,
                };
            }
        }
        SpriteTraits::default()
    }
}

fn rule(from: u32, to: u32, smooth: bool, scale_pct: u32) -> RangeRule {
    RangeRule {
        from,
        to,
        smooth,
        scale_pct,
    }
}

lazy_static! {
    /// Built-in table for the stock sprite layout.
    static ref BUILTIN: RangeClassifier = RangeClassifier::new(vec![
        rule(50, 57, false, 100),       // carved out of the GUI range
        rule(1, 1001, true, 100),       // GUI
        rule(10000, 12000, true, 100),  // items, coffin, berries, farn, ...
        rule(13000, 14000, true, 100),  // bones and towers, ...
        rule(16000, 17000, true, 100),  // cameron doors, carts, ...
        rule(20025, 20034, true, 100),  // torches
        rule(20042, 20082, true, 100),  // torches
        rule(20086, 20119, true, 100),  // chests, chairs
        rule(160000, 170000, true, 88), // mages, sized down to old client levels
        rule(100000, u32::MAX, true, 100), // all character sprites
    ]);
}

/// The stock table. Game layers with their own sprite layout load a JSON
/// table via [`RangeClassifier::from_json`] instead.
pub fn builtin() -> &'static RangeClassifier {
    &BUILTIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ranges() {
        let c = builtin();
        assert!(c.traits(500).smooth); // GUI
        assert!(!c.traits(52).smooth); // exclusion inside GUI range
        assert!(!c.traits(5000).smooth); // tiles stay sharp
        assert!(c.traits(10500).smooth); // items
        assert!(c.traits(123456).smooth); // characters
        assert_eq!(c.traits(123456).scale_pct, 100);
        assert_eq!(c.traits(165000).scale_pct, 88);
        assert!(c.traits(165000).smooth);
    }

    #[test]
    fn json_round_trip() {
        let json = r#"{"rules":[{"from":10,"to":20,"smooth":true}]}"#;
        let c = RangeClassifier::from_json(json).unwrap();
        assert!(c.traits(15).smooth);
        assert_eq!(c.traits(15).scale_pct, 100);
        assert!(!c.traits(20).smooth);
    }
}
