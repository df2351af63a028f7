use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::glyph_atlas::{MIN_CELL_HEIGHT_FACTOR, MIN_CELL_WIDTH_FACTOR};
use crate::kernel::KernelMode;
use crate::palette::{Palette, PaletteKind};
use crate::pipeline::{RenderSettings, DEFAULT_COLUMNS, DEFAULT_FONT_SIZE};

/// Column counts the settings layer offers.
pub const MIN_COLUMNS: u32 = 40;
pub const MAX_COLUMNS: u32 = 200;
pub const MAX_FONT_SIZE: f32 = 256.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PaletteChoice {
    Builtin(PaletteKind),
    Custom(CustomPalette),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPalette {
    pub custom: String,
}

impl PaletteChoice {
    pub fn palette(&self) -> Result<Palette> {
        match self {
            PaletteChoice::Builtin(kind) => Ok(kind.palette()),
            PaletteChoice::Custom(custom) => Palette::custom(&custom.custom),
        }
    }
}

impl Default for PaletteChoice {
    fn default() -> Self {
        PaletteChoice::Builtin(PaletteKind::Classic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColorRgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    #[serde(default = "default_alpha")]
    pub a: f32,
}

impl ColorRgba {
    pub const WHITE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub fn as_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn validate(&self, label: &str) -> Result<()> {
        for (channel, value) in [("r", self.r), ("g", self.g), ("b", self.b), ("a", self.a)] {
            if !value.is_finite() {
                bail!("{label}.{channel} must be finite");
            }
            if !(0.0..=1.0).contains(&value) {
                bail!("{label}.{channel} must be within [0, 1], got {value}");
            }
        }
        Ok(())
    }
}

fn default_alpha() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    #[serde(default)]
    pub palette: PaletteChoice,
    #[serde(default = "default_columns")]
    pub columns: u32,
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default)]
    pub colored: bool,
    #[serde(default)]
    pub invert: bool,
    #[serde(default = "default_contrast")]
    pub contrast: f32,
    #[serde(default = "default_foreground")]
    pub foreground: ColorRgba,
    #[serde(default = "default_background")]
    pub background: ColorRgba,
    #[serde(default)]
    pub output: Option<Resolution>,
}

fn default_columns() -> u32 {
    DEFAULT_COLUMNS
}

fn default_font_size() -> f32 {
    DEFAULT_FONT_SIZE
}

fn default_contrast() -> f32 {
    1.0
}

fn default_foreground() -> ColorRgba {
    ColorRgba::WHITE
}

fn default_background() -> ColorRgba {
    ColorRgba::BLACK
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            palette: PaletteChoice::default(),
            columns: DEFAULT_COLUMNS,
            rows: None,
            font_size: DEFAULT_FONT_SIZE,
            font_path: None,
            colored: false,
            invert: false,
            contrast: 1.0,
            foreground: ColorRgba::WHITE,
            background: ColorRgba::BLACK,
            output: None,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&self.columns) {
            bail!(
                "columns must be within {MIN_COLUMNS}..={MAX_COLUMNS}, got {}",
                self.columns
            );
        }
        if self.rows == Some(0) {
            bail!("rows must be > 0 when set");
        }
        validate_number("font_size", self.font_size)?;
        if self.font_size <= 0.0 || self.font_size > MAX_FONT_SIZE {
            bail!(
                "font_size must be within (0, {MAX_FONT_SIZE}], got {}",
                self.font_size
            );
        }
        validate_number("contrast", self.contrast)?;
        if self.contrast <= 0.0 {
            bail!("contrast must be > 0, got {}", self.contrast);
        }
        self.foreground.validate("foreground")?;
        self.background.validate("background")?;
        if let Some(output) = self.output {
            if output.width == 0 || output.height == 0 {
                bail!(
                    "output must be positive, got {}x{}",
                    output.width,
                    output.height
                );
            }
        }
        self.palette.palette().context("invalid palette")?;
        Ok(())
    }

    pub fn mode(&self) -> KernelMode {
        if self.colored {
            KernelMode::Colored
        } else {
            KernelMode::Monochrome {
                foreground: self.foreground.as_array(),
                background: self.background.as_array(),
            }
        }
    }

    /// Pipeline settings for an output of the given size. Rows default to the count
    /// that keeps glyph cells at the font's minimum cell aspect.
    pub fn settings(&self, output_width: u32, output_height: u32) -> Result<RenderSettings> {
        let rows = match self.rows {
            Some(rows) => rows,
            None => derive_rows(self.columns, output_width, output_height),
        };
        Ok(RenderSettings {
            columns: self.columns,
            rows,
            palette: self.palette.palette()?,
            mode: self.mode(),
            invert: self.invert,
            contrast: self.contrast,
            font_size: self.font_size,
        })
    }
}

pub fn derive_rows(columns: u32, output_width: u32, output_height: u32) -> u32 {
    if output_width == 0 {
        return 1;
    }
    let glyph_aspect = MIN_CELL_WIDTH_FACTOR / MIN_CELL_HEIGHT_FACTOR;
    let rows = columns as f32 * (output_height as f32 / output_width as f32) * glyph_aspect;
    (rows.round() as u32).max(1)
}

pub fn load_and_validate_config(path: &Path) -> Result<RenderConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config = parse_config(&contents)
        .with_context(|| format!("failed to parse yaml in {}", path.display()))?;

    // Font paths are relative to the config file.
    if let Some(font_path) = &config.font_path {
        if font_path.is_relative() {
            let config_dir = path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            config.font_path = Some(config_dir.join(font_path));
        }
    }
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<RenderConfig> {
    let config: RenderConfig = serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("{location}: {error}")
    })?;
    config.validate()?;
    Ok(config)
}

fn validate_number(label: &str, value: f32) -> Result<()> {
    if !value.is_finite() {
        bail!("{label} must be finite");
    }
    Ok(())
}
