//! Glyph mapping kernel.
//!
//! The WGSL compute shader in `shaders/wgsl/glyph_kernel.wgsl` does the per-frame work.
//! The functions here restate the same arithmetic on the CPU, in the same order and in
//! `f32`, and back the reference renderer used by tests and benchmarks.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use image::{Rgba, RgbaImage};

use crate::error_codes::{CodedError, INVALID_GRID};
use crate::glyph_atlas::AtlasImage;
use crate::source::SourceImage;

pub const GLYPH_KERNEL_WGSL: &str = include_str!("../shaders/wgsl/glyph_kernel.wgsl");
pub const COLORED_ENTRY_POINT: &str = "colored_main";
pub const MONOCHROME_ENTRY_POINT: &str = "monochrome_main";

/// Upper bound on samples per axis within one cell.
pub const MAX_SAMPLES_PER_AXIS: u32 = 8;
pub const SATURATION_BOOST: f32 = 1.3;
/// Channel spread below which a cell counts as gray and is left unboosted.
pub const CHROMA_EPSILON: f32 = 0.01;

/// Which compositing variant a dispatch runs, with the inputs only that variant needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelMode {
    Colored,
    Monochrome {
        foreground: [f32; 4],
        background: [f32; 4],
    },
}

impl KernelMode {
    pub fn entry_point(&self) -> &'static str {
        match self {
            KernelMode::Colored => COLORED_ENTRY_POINT,
            KernelMode::Monochrome { .. } => MONOCHROME_ENTRY_POINT,
        }
    }

    pub fn is_colored(&self) -> bool {
        matches!(self, KernelMode::Colored)
    }
}

impl Default for KernelMode {
    fn default() -> Self {
        KernelMode::Monochrome {
            foreground: [1.0, 1.0, 1.0, 1.0],
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Matches `RenderUniforms` in glyph_kernel.wgsl. 96 bytes, 16-byte aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct RenderUniforms {
    pub columns: u32,
    pub rows: u32,
    pub palette_size: u32,
    pub invert: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub glyph_cell_width: f32,
    pub atlas_width: f32,
    pub atlas_height: f32,
    pub font_size: f32,
    pub contrast: f32,
    pub _pad: [f32; 3],
    pub foreground: [f32; 4],
    pub background: [f32; 4],
}

impl RenderUniforms {
    /// Rejects grids the kernel cannot index: it does no validation of its own.
    pub fn validate(&self) -> Result<()> {
        if self.columns == 0 || self.rows == 0 {
            return Err(CodedError::frame(
                INVALID_GRID,
                format!("grid must be at least 1x1, got {}x{}", self.columns, self.rows),
            )
            .into());
        }
        if self.palette_size == 0 {
            return Err(CodedError::frame(INVALID_GRID, "palette size must be > 0").into());
        }
        if self.output_width == 0 || self.output_height == 0 {
            return Err(CodedError::frame(
                INVALID_GRID,
                format!(
                    "output must be non-empty, got {}x{}",
                    self.output_width, self.output_height
                ),
            )
            .into());
        }
        if self.glyph_cell_width <= 0.0 || self.atlas_height <= 0.0 {
            return Err(CodedError::frame(INVALID_GRID, "atlas geometry is degenerate").into());
        }
        Ok(())
    }

    pub fn cell(&self) -> CellLayout {
        CellLayout {
            columns: self.columns,
            rows: self.rows,
            output_width: self.output_width,
            output_height: self.output_height,
        }
    }
}

/// Output-space grid geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLayout {
    pub columns: u32,
    pub rows: u32,
    pub output_width: u32,
    pub output_height: u32,
}

/// The cell owning output pixel `(x, y)` and the pixel's position inside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellHit {
    pub cell_x: u32,
    pub cell_y: u32,
    pub local_x: f32,
    pub local_y: f32,
}

impl CellLayout {
    pub fn cell_size(&self) -> (f32, f32) {
        (
            self.output_width as f32 / self.columns as f32,
            self.output_height as f32 / self.rows as f32,
        )
    }

    pub fn locate(&self, x: u32, y: u32) -> CellHit {
        let (cell_width, cell_height) = self.cell_size();
        let px = x as f32;
        let py = y as f32;
        let cell_x = ((px / cell_width).floor() as u32).min(self.columns - 1);
        let cell_y = ((py / cell_height).floor() as u32).min(self.rows - 1);
        let local_x = ((px - cell_x as f32 * cell_width) / cell_width).clamp(0.0, LOCAL_MAX);
        let local_y = ((py - cell_y as f32 * cell_height) / cell_height).clamp(0.0, LOCAL_MAX);
        CellHit {
            cell_x,
            cell_y,
            local_x,
            local_y,
        }
    }
}

/// Keeps local coordinates inside `[0, 1)`.
const LOCAL_MAX: f32 = 0.99999;

/// Half-open source rectangle `[start, end)` covered by one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRegion {
    pub start_x: u32,
    pub end_x: u32,
    pub start_y: u32,
    pub end_y: u32,
}

impl SourceRegion {
    pub fn for_cell(
        cell_x: u32,
        cell_y: u32,
        columns: u32,
        rows: u32,
        source_width: u32,
        source_height: u32,
    ) -> Self {
        let src_cell_width = source_width as f32 / columns as f32;
        let src_cell_height = source_height as f32 / rows as f32;
        let start_x = ((cell_x as f32 * src_cell_width) as u32).min(source_width);
        let end_x = (((cell_x + 1) as f32 * src_cell_width) as u32).min(source_width);
        let start_y = ((cell_y as f32 * src_cell_height) as u32).min(source_height);
        let end_y = (((cell_y + 1) as f32 * src_cell_height) as u32).min(source_height);
        Self {
            start_x,
            end_x: end_x.max(start_x),
            start_y,
            end_y: end_y.max(start_y),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_x >= self.end_x || self.start_y >= self.end_y
    }

    /// Sample strides that cap the grid at `MAX_SAMPLES_PER_AXIS` per axis.
    pub fn steps(&self) -> (u32, u32) {
        (
            ((self.end_x - self.start_x) / MAX_SAMPLES_PER_AXIS).max(1),
            ((self.end_y - self.start_y) / MAX_SAMPLES_PER_AXIS).max(1),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CellSample {
    pub luminance: f32,
    pub color: [f32; 3],
    pub samples: u32,
}

/// Compute Rec.709 luminance from linear RGB.
pub fn rec709_luminance(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

/// Strided average of luminance and color. Empty regions average to black.
pub fn sample_region(source: &SourceImage<'_>, region: SourceRegion) -> CellSample {
    if region.is_empty() {
        return CellSample::default();
    }
    let (step_x, step_y) = region.steps();
    let mut luminance = 0.0;
    let mut color = [0.0f32; 3];
    let mut samples = 0u32;

    for y in (region.start_y..region.end_y).step_by(step_y as usize) {
        for x in (region.start_x..region.end_x).step_by(step_x as usize) {
            let [r, g, b] = source.rgb(x, y);
            luminance += rec709_luminance(r, g, b);
            color[0] += r;
            color[1] += g;
            color[2] += b;
            samples += 1;
        }
    }

    let count = samples as f32;
    CellSample {
        luminance: luminance / count,
        color: color.map(|channel| channel / count),
        samples,
    }
}

/// Contrast around mid-gray, then optional inversion.
pub fn adjust_luminance(luminance: f32, contrast: f32, invert: bool) -> f32 {
    let adjusted = ((luminance - 0.5) * contrast + 0.5).clamp(0.0, 1.0);
    if invert {
        1.0 - adjusted
    } else {
        adjusted
    }
}

/// Nearest-level glyph index; the shader uses `floor(x + 0.5)` to round halves up too.
pub fn glyph_index(adjusted: f32, palette_size: u32) -> u32 {
    let max_index = palette_size.saturating_sub(1) as f32;
    (adjusted * max_index + 0.5).floor().clamp(0.0, max_index) as u32
}

/// Atlas pixel sampled for a glyph at a cell-local position.
pub fn atlas_texel(
    glyph_index: u32,
    local_x: f32,
    local_y: f32,
    glyph_cell_width: f32,
    atlas_width: f32,
    atlas_height: f32,
) -> (u32, u32) {
    let atlas_x = (glyph_index as f32 + local_x) * glyph_cell_width;
    let atlas_y = local_y * atlas_height;
    (
        atlas_x.clamp(0.0, atlas_width - 1.0) as u32,
        atlas_y.clamp(0.0, atlas_height - 1.0) as u32,
    )
}

/// Pushes chroma away from the color's mid-lightness; near-gray colors pass through.
pub fn boost_saturation(color: [f32; 3]) -> [f32; 3] {
    let max = color[0].max(color[1]).max(color[2]);
    let min = color[0].min(color[1]).min(color[2]);
    if max - min <= CHROMA_EPSILON {
        return color;
    }
    let mid = (max + min) * 0.5;
    color.map(|channel| (mid + (channel - mid) * SATURATION_BOOST).clamp(0.0, 1.0))
}

pub fn composite_colored(color: [f32; 3], coverage: f32) -> [f32; 4] {
    let boosted = boost_saturation(color);
    [
        boosted[0] * coverage,
        boosted[1] * coverage,
        boosted[2] * coverage,
        1.0,
    ]
}

pub fn composite_monochrome(foreground: [f32; 4], background: [f32; 4], coverage: f32) -> [f32; 4] {
    let mix = |bg: f32, fg: f32| bg + (fg - bg) * coverage;
    [
        mix(background[0], foreground[0]),
        mix(background[1], foreground[1]),
        mix(background[2], foreground[2]),
        1.0,
    ]
}

/// Glyph indices for every cell, row-major. Mirrors steps 1–5 of the shader.
pub fn glyph_index_grid(source: &SourceImage<'_>, uniforms: &RenderUniforms) -> Vec<u32> {
    let mut indices = Vec::with_capacity((uniforms.columns * uniforms.rows) as usize);
    for cell_y in 0..uniforms.rows {
        for cell_x in 0..uniforms.columns {
            let region = SourceRegion::for_cell(
                cell_x,
                cell_y,
                uniforms.columns,
                uniforms.rows,
                source.width(),
                source.height(),
            );
            let sample = sample_region(source, region);
            let adjusted = adjust_luminance(sample.luminance, uniforms.contrast, uniforms.invert != 0);
            indices.push(glyph_index(adjusted, uniforms.palette_size));
        }
    }
    indices
}

/// CPU rendition of one dispatch. Produces the image the GPU kernel writes.
pub fn render_reference(
    source: &SourceImage<'_>,
    atlas: &AtlasImage,
    uniforms: &RenderUniforms,
    mode: KernelMode,
) -> Result<RgbaImage> {
    uniforms.validate()?;
    let layout = uniforms.cell();
    let samples = (0..uniforms.rows)
        .flat_map(|cell_y| (0..uniforms.columns).map(move |cell_x| (cell_x, cell_y)))
        .map(|(cell_x, cell_y)| {
            let region = SourceRegion::for_cell(
                cell_x,
                cell_y,
                uniforms.columns,
                uniforms.rows,
                source.width(),
                source.height(),
            );
            let sample = sample_region(source, region);
            let adjusted =
                adjust_luminance(sample.luminance, uniforms.contrast, uniforms.invert != 0);
            (sample, glyph_index(adjusted, uniforms.palette_size))
        })
        .collect::<Vec<_>>();

    let mut output = RgbaImage::new(uniforms.output_width, uniforms.output_height);
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let hit = layout.locate(x, y);
        let (sample, index) = samples[(hit.cell_y * uniforms.columns + hit.cell_x) as usize];
        let (ax, ay) = atlas_texel(
            index,
            hit.local_x,
            hit.local_y,
            uniforms.glyph_cell_width,
            uniforms.atlas_width,
            uniforms.atlas_height,
        );
        let coverage = f32::from(atlas.image.get_pixel(ax, ay)[3]) / 255.0;
        let rgba = match mode {
            KernelMode::Colored => composite_colored(sample.color, coverage),
            KernelMode::Monochrome {
                foreground,
                background,
            } => composite_monochrome(foreground, background, coverage),
        };
        *pixel = Rgba(rgba.map(unorm_to_u8));
    }
    Ok(output)
}

/// Same rounding as an `rgba8unorm` storage write.
pub fn unorm_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChannelLayout;

    fn uniforms(columns: u32, rows: u32, src: (u32, u32), out: (u32, u32)) -> RenderUniforms {
        RenderUniforms {
            columns,
            rows,
            palette_size: 10,
            invert: 0,
            source_width: src.0,
            source_height: src.1,
            output_width: out.0,
            output_height: out.1,
            glyph_cell_width: 8.0,
            atlas_width: 80.0,
            atlas_height: 16.0,
            font_size: 12.0,
            contrast: 1.0,
            _pad: [0.0; 3],
            foreground: [1.0; 4],
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }

    #[test]
    fn render_uniforms_is_96_bytes() {
        assert_eq!(
            std::mem::size_of::<RenderUniforms>(),
            96,
            "RenderUniforms must be 96 bytes to match WGSL struct"
        );
    }

    #[test]
    fn every_output_pixel_lands_in_exactly_one_cell() {
        for (columns, rows, width, height) in [(3, 2, 10, 7), (7, 5, 64, 33), (1, 1, 5, 5)] {
            let layout = CellLayout {
                columns,
                rows,
                output_width: width,
                output_height: height,
            };
            let mut counts = vec![0u32; (columns * rows) as usize];
            for y in 0..height {
                for x in 0..width {
                    let hit = layout.locate(x, y);
                    assert!(hit.cell_x < columns && hit.cell_y < rows);
                    assert!((0.0..1.0).contains(&hit.local_x));
                    assert!((0.0..1.0).contains(&hit.local_y));
                    counts[(hit.cell_y * columns + hit.cell_x) as usize] += 1;
                }
            }
            assert_eq!(counts.iter().sum::<u32>(), width * height);
            assert!(counts.iter().all(|&count| count > 0));
        }
    }

    #[test]
    fn every_cell_has_a_source_region_when_source_covers_the_grid() {
        for (columns, rows, width, height) in [(40, 30, 40, 30), (97, 41, 640, 480), (3, 3, 4, 5)] {
            for cell_y in 0..rows {
                for cell_x in 0..columns {
                    let region = SourceRegion::for_cell(cell_x, cell_y, columns, rows, width, height);
                    assert!(!region.is_empty(), "cell ({cell_x},{cell_y}) of {columns}x{rows}");
                    assert!(region.end_x <= width && region.end_y <= height);
                }
            }
        }
    }

    #[test]
    fn sampling_is_capped_per_axis() {
        let region = SourceRegion {
            start_x: 0,
            end_x: 64,
            start_y: 0,
            end_y: 16,
        };
        assert_eq!(region.steps(), (8, 2));
        let region = SourceRegion {
            start_x: 3,
            end_x: 5,
            start_y: 0,
            end_y: 1,
        };
        assert_eq!(region.steps(), (1, 1));
    }

    #[test]
    fn empty_region_samples_to_black() {
        let data = [255u8; 4];
        let source = SourceImage::new(&data, 1, 1, ChannelLayout::Rgba8).unwrap();
        let region = SourceRegion {
            start_x: 1,
            end_x: 1,
            start_y: 0,
            end_y: 1,
        };
        assert_eq!(sample_region(&source, region), CellSample::default());
    }

    #[test]
    fn unit_contrast_without_invert_is_identity() {
        for i in 0..=100 {
            let luminance = i as f32 / 100.0;
            assert!((adjust_luminance(luminance, 1.0, false) - luminance).abs() < 1e-6);
        }
    }

    #[test]
    fn contrast_is_applied_before_inversion() {
        // 0.8 at contrast 2 clips to 1.0, then inverts to 0.0.
        assert_eq!(adjust_luminance(0.8, 2.0, true), 0.0);
        assert!((adjust_luminance(0.6, 2.0, true) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn glyph_index_matches_palette_mapping() {
        for i in 0..=200 {
            let luminance = i as f32 / 200.0;
            assert_eq!(
                glyph_index(luminance, 10),
                crate::palette::luminance_to_glyph_index(luminance, 10),
                "luminance {luminance}"
            );
        }
    }

    #[test]
    fn black_and_white_halves_map_to_extreme_glyphs() {
        let data = [0, 0, 0, 255, 255, 255, 255, 255];
        let source = SourceImage::new(&data, 2, 1, ChannelLayout::Rgba8).unwrap();
        let mut params = uniforms(2, 1, (2, 1), (16, 8));
        assert_eq!(glyph_index_grid(&source, &params), vec![0, 9]);
        params.invert = 1;
        assert_eq!(glyph_index_grid(&source, &params), vec![9, 0]);
    }

    #[test]
    fn atlas_texel_selects_the_glyph_cell_and_clamps() {
        assert_eq!(atlas_texel(0, 0.0, 0.0, 8.0, 80.0, 16.0), (0, 0));
        assert_eq!(atlas_texel(3, 0.5, 0.5, 8.0, 80.0, 16.0), (28, 8));
        assert_eq!(atlas_texel(9, 0.99999, 0.99999, 8.0, 80.0, 16.0), (79, 15));
        assert_eq!(atlas_texel(12, 0.5, 0.5, 8.0, 80.0, 16.0), (79, 8));
    }

    #[test]
    fn monochrome_coverage_selects_foreground_or_background() {
        let fg = [0.0, 1.0, 0.0, 1.0];
        let bg = [0.0, 0.0, 0.0, 1.0];
        assert_eq!(composite_monochrome(fg, bg, 1.0), fg);
        assert_eq!(composite_monochrome(fg, bg, 0.0), bg);
    }

    #[test]
    fn gray_cells_are_not_saturated() {
        let gray = [0.5, 0.505, 0.5];
        assert_eq!(boost_saturation(gray), gray);
    }

    #[test]
    fn chromatic_cells_are_pushed_apart() {
        let boosted = boost_saturation([0.6, 0.4, 0.4]);
        assert!(boosted[0] > 0.6);
        assert!(boosted[1] < 0.4);
        let composited = composite_colored([0.6, 0.4, 0.4], 0.0);
        assert_eq!(composited, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn zero_grid_is_rejected_before_dispatch() {
        assert!(uniforms(0, 1, (2, 2), (4, 4)).validate().is_err());
        assert!(uniforms(1, 0, (2, 2), (4, 4)).validate().is_err());
        let mut params = uniforms(1, 1, (2, 2), (4, 4));
        params.palette_size = 0;
        assert!(params.validate().is_err());
        assert!(uniforms(1, 1, (2, 2), (4, 4)).validate().is_ok());
    }

    #[test]
    fn kernel_mode_selects_entry_point() {
        assert_eq!(KernelMode::Colored.entry_point(), COLORED_ENTRY_POINT);
        assert_eq!(KernelMode::default().entry_point(), MONOCHROME_ENTRY_POINT);
    }

    #[test]
    fn wgsl_source_declares_both_entry_points_and_uniforms() {
        assert!(GLYPH_KERNEL_WGSL.contains("fn colored_main"));
        assert!(GLYPH_KERNEL_WGSL.contains("fn monochrome_main"));
        assert!(GLYPH_KERNEL_WGSL.contains("struct RenderUniforms"));
        assert!(GLYPH_KERNEL_WGSL.contains("{{TILE}}"));
    }
}
