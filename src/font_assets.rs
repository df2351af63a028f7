use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use fontdue::Font;

/// Environment variable that overrides the monospaced font lookup.
pub const FONT_PATH_ENV: &str = "GLYPHCAM_FONT";

/// Well-known monospaced fonts, probed in order when no path is configured.
pub const SYSTEM_MONOSPACE_CANDIDATES: [&str; 10] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/usr/share/fonts/liberation-mono/LiberationMono-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansMono-Regular.ttf",
    "/usr/share/fonts/noto/NotoSansMono-Regular.ttf",
    "/System/Library/Fonts/Menlo.ttc",
    "/Library/Fonts/Courier New.ttf",
    "C:\\Windows\\Fonts\\consola.ttf",
];

/// A parsed font plus the path it came from.
pub struct MonospaceFont {
    path: PathBuf,
    font: Font,
}

impl MonospaceFont {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read font file {}", path.display()))?;
        Self::from_bytes(path.to_path_buf(), bytes)
    }

    pub fn from_bytes(path: PathBuf, bytes: Vec<u8>) -> Result<Self> {
        let font = Font::from_bytes(bytes, fontdue::FontSettings::default())
            .map_err(|error| anyhow!("failed to parse font {}: {error}", path.display()))?;
        Ok(Self { path, font })
    }

    /// Loads `explicit` if given, else `$GLYPHCAM_FONT`, else the first system candidate.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_font_path(explicit)?;
        Self::load(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn font(&self) -> &Font {
        &self.font
    }
}

impl std::fmt::Debug for MonospaceFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonospaceFont")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub fn resolve_font_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("configured font '{}' does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(FONT_PATH_ENV).map(PathBuf::from) {
        if !path.is_file() {
            bail!(
                "{FONT_PATH_ENV} points at '{}', which does not exist",
                path.display()
            );
        }
        return Ok(path);
    }

    SYSTEM_MONOSPACE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| {
            anyhow!(
                "no monospaced font found; set {FONT_PATH_ENV} or configure font_path (tried: {})",
                SYSTEM_MONOSPACE_CANDIDATES.join(", ")
            )
        })
}

/// Rejects glyphs the font cannot draw. Whitespace is always accepted since it renders blank.
pub fn ensure_supported_codepoints(font: &Font, glyphs: &[char], font_name: &str) -> Result<()> {
    for &ch in glyphs {
        if ch.is_whitespace() {
            continue;
        }
        if font.lookup_glyph_index(ch) == 0 {
            return Err(anyhow!(
                "unsupported codepoint U+{:04X} ({}) in {}",
                ch as u32,
                ch.escape_default(),
                font_name
            ));
        }
    }
    Ok(())
}
