use std::fmt;

use anyhow::{bail, Result};
use serde::Deserialize;

/// Ten-step ASCII ramp, lightest first.
pub const CLASSIC_RAMP: &str = " .:-=+*#%@";
/// Five-step block-element ramp, lightest first.
pub const UNICODE_RAMP: &str = " ░▒▓█";

pub const MIN_LEVELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaletteKind {
    #[default]
    Classic,
    Unicode,
}

impl PaletteKind {
    pub fn ramp(self) -> &'static str {
        match self {
            PaletteKind::Classic => CLASSIC_RAMP,
            PaletteKind::Unicode => UNICODE_RAMP,
        }
    }

    pub fn palette(self) -> Palette {
        Palette {
            name: self.name().to_owned(),
            glyphs: self.ramp().chars().collect(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PaletteKind::Classic => "classic",
            PaletteKind::Unicode => "unicode",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(PaletteKind::Classic),
            "unicode" => Ok(PaletteKind::Unicode),
            other => bail!("unknown palette '{other}', expected 'classic' or 'unicode'"),
        }
    }
}

/// Ordered glyph ramp from lightest to heaviest visual weight.
///
/// Position is what matters: duplicate characters are allowed and each
/// occupies its own atlas cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Palette {
    name: String,
    glyphs: Vec<char>,
}

impl Palette {
    pub fn classic() -> Self {
        PaletteKind::Classic.palette()
    }

    pub fn unicode() -> Self {
        PaletteKind::Unicode.palette()
    }

    pub fn custom(ramp: &str) -> Result<Self> {
        let glyphs = ramp
            .chars()
            .filter(|ch| !matches!(ch, '\n' | '\r' | '\t'))
            .collect::<Vec<_>>();
        if glyphs.len() < MIN_LEVELS {
            bail!(
                "palette must contain at least {MIN_LEVELS} glyphs, got {}",
                glyphs.len()
            );
        }
        Ok(Self {
            name: "custom".to_owned(),
            glyphs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn levels(&self) -> u32 {
        self.glyphs.len() as u32
    }

    pub fn glyphs(&self) -> &[char] {
        &self.glyphs
    }

    pub fn glyph(&self, index: u32) -> Option<char> {
        self.glyphs.get(index as usize).copied()
    }

    pub fn index_for_luminance(&self, luminance: f32) -> u32 {
        luminance_to_glyph_index(luminance, self.levels())
    }

    pub fn character_for_luminance(&self, luminance: f32) -> char {
        self.glyphs[self.index_for_luminance(luminance) as usize]
    }
}

impl fmt::Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} levels)", self.name, self.glyphs.len())
    }
}

/// Nearest-level mapping of luminance [0, 1] onto a ramp of `levels` glyphs.
///
/// Light pixels map to low indices, so index 0 is the lightest glyph.
/// Formula: `clamp(round(luma * (levels - 1)), 0, levels - 1)`.
pub fn luminance_to_glyph_index(luminance: f32, levels: u32) -> u32 {
    if levels == 0 {
        return 0;
    }
    let max_index = (levels - 1) as f32;
    let luminance = if luminance.is_nan() {
        0.0
    } else {
        luminance.clamp(0.0, 1.0)
    };
    ((luminance * max_index).round() as u32).min(levels - 1)
}
