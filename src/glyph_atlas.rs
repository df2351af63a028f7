//! Glyph atlas generation.
//!
//! Every palette glyph is rasterized with the monospaced font and packed left to right
//! into a single strip of equal-width cells. Glyphs are drawn in opaque white so the
//! alpha channel alone carries coverage; the compositor ignores the stored color.

use anyhow::{anyhow, bail, Context, Result};
use fontdue::Font;
use image::{Rgba, RgbaImage};
use log::debug;

use crate::error_codes::CodedError;
use crate::font_assets::{ensure_supported_codepoints, MonospaceFont};
use crate::palette::Palette;

/// Padding added to the largest glyph box on each axis.
pub const CELL_MARGIN: u32 = 2;
/// Lower bound for cell width, relative to the font size.
pub const MIN_CELL_WIDTH_FACTOR: f32 = 0.7;
/// Lower bound for cell height, relative to the font size.
pub const MIN_CELL_HEIGHT_FACTOR: f32 = 1.2;

/// A rasterized glyph plus the placement metrics needed to seat it on a baseline.
#[derive(Debug, Clone)]
pub struct GlyphBitmap {
    pub advance: f32,
    pub xmin: i32,
    pub ymin: i32,
    pub width: usize,
    pub height: usize,
    pub bitmap: Vec<u8>,
}

impl GlyphBitmap {
    /// A blank glyph such as a space: advance only, no ink.
    pub fn blank(advance: f32) -> Self {
        Self {
            advance,
            xmin: 0,
            ymin: 0,
            width: 0,
            height: 0,
            bitmap: Vec::new(),
        }
    }
}

/// Ascent/descent of the font line at the rasterized size. Descent is negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineBox {
    pub ascent: f32,
    pub descent: f32,
}

impl LineBox {
    pub fn for_font(font: &Font, font_size: f32) -> Self {
        match font.horizontal_line_metrics(font_size) {
            Some(metrics) => Self {
                ascent: metrics.ascent,
                descent: metrics.descent,
            },
            None => Self {
                ascent: font_size * 0.8,
                descent: -font_size * 0.2,
            },
        }
    }

    pub fn height(&self) -> f32 {
        self.ascent - self.descent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasGeometry {
    pub cell_width: u32,
    pub cell_height: u32,
    pub glyph_count: u32,
}

impl AtlasGeometry {
    pub fn width(&self) -> u32 {
        self.cell_width * self.glyph_count
    }

    pub fn height(&self) -> u32 {
        self.cell_height
    }
}

/// Build parameters an atlas was produced from.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasKey {
    pub palette: Palette,
    pub font_size: f32,
}

impl AtlasKey {
    pub fn matches(&self, palette: &Palette, font_size: f32) -> bool {
        self.palette == *palette && (self.font_size - font_size).abs() <= f32::EPSILON
    }
}

/// CPU-side atlas strip, ready for upload.
#[derive(Debug, Clone)]
pub struct AtlasImage {
    pub key: AtlasKey,
    pub geometry: AtlasGeometry,
    pub image: RgbaImage,
}

impl AtlasImage {
    pub fn build(palette: &Palette, font: &MonospaceFont, font_size: f32) -> Result<Self> {
        if !font_size.is_finite() || font_size <= 0.0 {
            bail!("font size must be a positive number, got {font_size}");
        }
        let font_name = font.path().display().to_string();
        ensure_supported_codepoints(font.font(), palette.glyphs(), &font_name)?;

        let glyphs = rasterize_palette(font.font(), palette, font_size);
        let line = LineBox::for_font(font.font(), font_size);
        let (geometry, image) = pack_strip(&glyphs, line, font_size)?;
        debug!(
            "built glyph atlas for {palette} at {font_size}px: {}x{} cells, {}x{} strip",
            geometry.cell_width,
            geometry.cell_height,
            geometry.width(),
            geometry.height()
        );

        Ok(Self {
            key: AtlasKey {
                palette: palette.clone(),
                font_size,
            },
            geometry,
            image,
        })
    }
}

pub fn rasterize_palette(font: &Font, palette: &Palette, font_size: f32) -> Vec<GlyphBitmap> {
    palette
        .glyphs()
        .iter()
        .map(|&ch| {
            let (metrics, bitmap) = font.rasterize(ch, font_size);
            GlyphBitmap {
                advance: metrics.advance_width,
                xmin: metrics.xmin,
                ymin: metrics.ymin,
                width: metrics.width,
                height: metrics.height,
                bitmap,
            }
        })
        .collect()
}

/// Uniform cell size: the largest glyph box plus margin, floored by the font size.
pub fn cell_size(glyphs: &[GlyphBitmap], line: LineBox, font_size: f32) -> (u32, u32) {
    let mut width = (MIN_CELL_WIDTH_FACTOR * font_size).ceil() as u32;
    let mut height = (MIN_CELL_HEIGHT_FACTOR * font_size).ceil() as u32;
    let line_height = line.height().max(0.0);

    for glyph in glyphs {
        let box_width = glyph.advance.max(glyph.width as f32);
        let box_height = line_height.max(glyph.height as f32);
        width = width.max(box_width.ceil() as u32 + CELL_MARGIN);
        height = height.max(box_height.ceil() as u32 + CELL_MARGIN);
    }

    (width.max(1), height.max(1))
}

/// Packs glyphs into a transparent strip, one centered glyph per cell.
pub fn pack_strip(
    glyphs: &[GlyphBitmap],
    line: LineBox,
    font_size: f32,
) -> Result<(AtlasGeometry, RgbaImage)> {
    if glyphs.is_empty() {
        return Err(CodedError::atlas("cannot build an atlas from an empty palette").into());
    }

    let (cell_width, cell_height) = cell_size(glyphs, line, font_size);
    let glyph_count = glyphs.len() as u32;
    let strip_width = cell_width
        .checked_mul(glyph_count)
        .ok_or_else(|| anyhow!("atlas width overflow for {glyph_count} glyphs"))?;

    let mut image = RgbaImage::from_pixel(strip_width, cell_height, Rgba([0, 0, 0, 0]));

    // The line box is centered vertically; each glyph sits on the shared baseline.
    let baseline = ((cell_height as f32 - line.height()) / 2.0 + line.ascent).round() as i64;

    for (index, glyph) in glyphs.iter().enumerate() {
        if glyph.bitmap.len() < glyph.width * glyph.height {
            return Err(CodedError::atlas(format!(
                "glyph {index} bitmap is truncated ({} bytes for {}x{})",
                glyph.bitmap.len(),
                glyph.width,
                glyph.height
            ))
            .into());
        }

        let cell_x = index as i64 * cell_width as i64;
        let pen_x = ((cell_width as f32 - glyph.advance) / 2.0).round() as i64;
        let left = cell_x + pen_x + glyph.xmin as i64;
        let top = baseline - glyph.ymin as i64 - glyph.height as i64;

        for row in 0..glyph.height {
            for col in 0..glyph.width {
                let coverage = glyph.bitmap[row * glyph.width + col];
                if coverage == 0 {
                    continue;
                }
                let px = left + col as i64;
                let py = top + row as i64;
                // Ink never bleeds into a neighbouring cell.
                if px < cell_x || px >= cell_x + cell_width as i64 {
                    continue;
                }
                if py < 0 || py >= cell_height as i64 {
                    continue;
                }
                image.put_pixel(px as u32, py as u32, Rgba([255, 255, 255, coverage]));
            }
        }
    }

    Ok((
        AtlasGeometry {
            cell_width,
            cell_height,
            glyph_count,
        },
        image,
    ))
}

/// Atlas strip resident on the GPU.
pub struct GpuAtlas {
    pub key: AtlasKey,
    pub geometry: AtlasGeometry,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl GpuAtlas {
    pub fn upload(device: &wgpu::Device, queue: &wgpu::Queue, atlas: &AtlasImage) -> Result<Self> {
        let (width, height) = atlas.image.dimensions();
        let max_dimension = device.limits().max_texture_dimension_2d;
        if width > max_dimension || height > max_dimension {
            return Err(CodedError::atlas(format!(
                "atlas {width}x{height} exceeds the device texture limit {max_dimension}"
            ))
            .into());
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("glyphcam-atlas-texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            atlas.image.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            size,
        );

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        if let Some(error) = validation.or(out_of_memory) {
            return Err(CodedError::atlas(format!("atlas upload failed: {error}")).into());
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Self {
            key: atlas.key.clone(),
            geometry: atlas.geometry,
            texture,
            view,
        })
    }

    pub fn build(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        palette: &Palette,
        font: &MonospaceFont,
        font_size: f32,
    ) -> Result<Self> {
        let image = AtlasImage::build(palette, font, font_size)
            .with_context(|| format!("failed to rasterize atlas for {palette}"))?;
        Self::upload(device, queue, &image)
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}
