//! GPU glyph pipeline.
//!
//! Owns the device, both compute pipelines, the glyph atlas and the output texture, and
//! turns one source frame into one glyph image per call:
//!
//! 1. **Atlas**: rebuilt inline when palette or font size changed since the last build
//! 2. **Output**: recreated only when the requested size changed
//! 3. **Upload**: the borrowed source frame is written into a reusable source texture
//! 4. **Dispatch**: colored or monochrome kernel over the full output, in square tiles
//! 5. **Wait**: the call returns only after the GPU has finished writing
//!
//! Every GPU resource is owned here exclusively and rebuilt by compare-and-replace.

use std::num::NonZeroU64;

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use log::{debug, info, warn};

use crate::error_codes::{CodedError, INVALID_SOURCE_FRAME, PIPELINE_CREATION_FAILED};
use crate::font_assets::MonospaceFont;
use crate::glyph_atlas::{AtlasGeometry, GpuAtlas};
use crate::gpu::GpuContext;
use crate::kernel::{
    KernelMode, RenderUniforms, COLORED_ENTRY_POINT, GLYPH_KERNEL_WGSL, MONOCHROME_ENTRY_POINT,
};
use crate::palette::Palette;
use crate::readback::{read_texture_as, RawFrame};
use crate::source::{ChannelLayout, FrameMetadata, SourceImage};

pub const DEFAULT_COLUMNS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 45;
pub const DEFAULT_FONT_SIZE: f32 = 14.0;

/// Layout of the output texture as written by the kernel.
pub const OUTPUT_LAYOUT: ChannelLayout = ChannelLayout::Rgba8;

/// Everything a render call reads from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub columns: u32,
    pub rows: u32,
    pub palette: Palette,
    pub mode: KernelMode,
    pub invert: bool,
    pub contrast: f32,
    pub font_size: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS,
            rows: DEFAULT_ROWS,
            palette: Palette::classic(),
            mode: KernelMode::default(),
            invert: false,
            contrast: 1.0,
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtlasState {
    /// The bound atlas does not match the configured palette or font size.
    Stale,
    Current,
}

/// Counters for resource churn and skipped frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub atlas_builds: u64,
    pub atlas_failures: u64,
    pub output_recreations: u64,
    pub frames_rendered: u64,
    pub frames_skipped: u64,
}

/// The GPU-resident destination image, reused frame over frame.
pub struct OutputImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl OutputImage {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

struct SourceTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    layout: ChannelLayout,
}

/// A completed render. Holds the pipeline borrowed, so the output cannot be
/// overwritten by another render until this value is dropped.
pub struct RenderedFrame<'a> {
    pipeline: &'a GlyphPipeline,
    output: &'a OutputImage,
    pub metadata: FrameMetadata,
}

impl<'a> RenderedFrame<'a> {
    pub fn output(&self) -> &'a OutputImage {
        self.output
    }

    pub fn read_as_image(&self) -> Result<RgbaImage> {
        self.pipeline.read_as_image(self.output)
    }

    pub fn read_as_raw_frame(&self, layout: ChannelLayout) -> Result<RawFrame> {
        self.pipeline
            .read_as_raw_frame(self.output, layout, self.metadata)
    }
}

pub struct GlyphPipeline {
    gpu: GpuContext,
    font: MonospaceFont,
    settings: RenderSettings,
    atlas: GpuAtlas,
    atlas_state: AtlasState,
    rebuild_pending: bool,
    output: Option<OutputImage>,
    output_size: (u32, u32),
    source: Option<SourceTexture>,
    bind_group_layout: wgpu::BindGroupLayout,
    colored_pipeline: wgpu::ComputePipeline,
    monochrome_pipeline: wgpu::ComputePipeline,
    uniform_buffer: wgpu::Buffer,
    stats: PipelineStats,
}

impl GlyphPipeline {
    /// Creates the compute pipelines and the initial atlas. Any failure here is fatal:
    /// the frame source must not start without a working pipeline.
    pub fn new(
        gpu: GpuContext,
        font: MonospaceFont,
        settings: RenderSettings,
        output_width: u32,
        output_height: u32,
    ) -> Result<Self> {
        let device = &gpu.device;
        let shader_src = GLYPH_KERNEL_WGSL.replace("{{TILE}}", &gpu.tile().to_string());

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("glyphcam-kernel"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        // @binding(0) source texture, @binding(1) atlas texture,
        // @binding(2) output storage texture, @binding(3) RenderUniforms
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("glyphcam-kernel-bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(
                            std::mem::size_of::<RenderUniforms>() as u64
                        ),
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("glyphcam-kernel-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&layout),
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            })
        };
        let colored_pipeline = make_pipeline(COLORED_ENTRY_POINT);
        let monochrome_pipeline = make_pipeline(MONOCHROME_ENTRY_POINT);

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(CodedError::setup(
                PIPELINE_CREATION_FAILED,
                format!("failed to create glyph kernel pipelines: {error}"),
            )
            .into());
        }

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("glyphcam-uniforms"),
            size: std::mem::size_of::<RenderUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let atlas = GpuAtlas::build(
            device,
            &gpu.queue,
            &settings.palette,
            &font,
            settings.font_size,
        )
        .context("failed to build the initial glyph atlas")?;

        info!(
            "glyph pipeline ready: {}x{} grid, {}, tile {}",
            settings.columns,
            settings.rows,
            settings.palette,
            gpu.tile()
        );

        Ok(Self {
            gpu,
            font,
            settings,
            atlas,
            atlas_state: AtlasState::Current,
            rebuild_pending: false,
            output: None,
            output_size: (output_width, output_height),
            source: None,
            bind_group_layout,
            colored_pipeline,
            monochrome_pipeline,
            uniform_buffer,
            stats: PipelineStats {
                atlas_builds: 1,
                ..PipelineStats::default()
            },
        })
    }

    /// Applies new settings on the next render. Marks the atlas stale only when the
    /// palette or font size differs from what the current atlas was built with.
    pub fn configure(&mut self, settings: RenderSettings) {
        if self
            .atlas
            .key
            .matches(&settings.palette, settings.font_size)
        {
            self.atlas_state = AtlasState::Current;
            self.rebuild_pending = false;
        } else {
            debug!(
                "atlas stale: {} at {}px requested",
                settings.palette, settings.font_size
            );
            self.atlas_state = AtlasState::Stale;
            self.rebuild_pending = true;
        }
        self.settings = settings;
    }

    /// Requests a new output size. A no-op when the size is unchanged.
    pub fn set_output_size(&mut self, width: u32, height: u32) {
        if self.output_size != (width, height) {
            debug!("output size {}x{} requested", width, height);
            self.output_size = (width, height);
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn atlas_state(&self) -> AtlasState {
        self.atlas_state
    }

    pub fn atlas_geometry(&self) -> AtlasGeometry {
        self.atlas.geometry
    }

    /// Palette the active atlas was built from; may lag `settings().palette` after a failed build.
    pub fn atlas_palette(&self) -> &Palette {
        &self.atlas.key.palette
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// The last written output, if any frame has been rendered at the current size.
    pub fn output(&self) -> Option<&OutputImage> {
        self.output.as_ref()
    }

    /// Renders one frame and waits for the GPU. `None` means "skip this frame".
    pub fn render_frame(&mut self, source: &SourceImage<'_>) -> Option<RenderedFrame<'_>> {
        match self.try_render(source) {
            Ok(()) => {
                self.stats.frames_rendered += 1;
                let output = self.output.as_ref()?;
                Some(RenderedFrame {
                    pipeline: &*self,
                    output,
                    metadata: source.metadata,
                })
            }
            Err(error) => {
                self.stats.frames_skipped += 1;
                debug!("skipping frame: {error:#}");
                None
            }
        }
    }

    /// Synchronous readback packaged as an RGBA image.
    pub fn read_as_image(&self, output: &OutputImage) -> Result<RgbaImage> {
        let pixels = read_texture_as(
            &self.gpu,
            &output.texture,
            output.width,
            output.height,
            OUTPUT_LAYOUT,
            ChannelLayout::Rgba8,
        )
        .context("still image readback failed")?;
        RgbaImage::from_raw(output.width, output.height, pixels)
            .ok_or_else(|| CodedError::readback("readback size does not match output").into())
    }

    /// Synchronous readback into a freshly allocated buffer for a video encoder.
    pub fn read_as_raw_frame(
        &self,
        output: &OutputImage,
        layout: ChannelLayout,
        metadata: FrameMetadata,
    ) -> Result<RawFrame> {
        let data = read_texture_as(
            &self.gpu,
            &output.texture,
            output.width,
            output.height,
            OUTPUT_LAYOUT,
            layout,
        )
        .context("raw frame readback failed")?;
        Ok(RawFrame {
            width: output.width,
            height: output.height,
            bytes_per_row: output.width * 4,
            layout,
            data,
            metadata,
        })
    }

    /// Current uniforms for a source of the given size.
    pub fn uniforms_for(&self, source_width: u32, source_height: u32) -> RenderUniforms {
        let (foreground, background) = match self.settings.mode {
            KernelMode::Colored => ([1.0; 4], [0.0, 0.0, 0.0, 1.0]),
            KernelMode::Monochrome {
                foreground,
                background,
            } => (foreground, background),
        };
        let geometry = self.atlas.geometry;
        RenderUniforms {
            columns: self.settings.columns,
            rows: self.settings.rows,
            // Index against the atlas actually bound, which may predate the settings.
            palette_size: geometry.glyph_count,
            invert: u32::from(self.settings.invert),
            source_width,
            source_height,
            output_width: self.output_size.0,
            output_height: self.output_size.1,
            glyph_cell_width: geometry.cell_width as f32,
            atlas_width: geometry.width() as f32,
            atlas_height: geometry.height() as f32,
            font_size: self.atlas.key.font_size,
            contrast: self.settings.contrast,
            _pad: [0.0; 3],
            foreground,
            background,
        }
    }

    fn try_render(&mut self, source: &SourceImage<'_>) -> Result<()> {
        self.ensure_atlas();
        let uniforms = self.uniforms_for(source.width(), source.height());
        uniforms.validate()?;
        self.ensure_output()?;
        self.upload_source(source)?;

        let output = self
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("output image missing"))?;
        let source_texture = self
            .source
            .as_ref()
            .ok_or_else(|| CodedError::frame(INVALID_SOURCE_FRAME, "source view missing"))?;

        self.gpu
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("glyphcam-kernel-bg"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&source_texture.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(self.atlas.view()),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&output.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: self.uniform_buffer.as_entire_binding(),
                    },
                ],
            });

        let pipeline = match self.settings.mode {
            KernelMode::Colored => &self.colored_pipeline,
            KernelMode::Monochrome { .. } => &self.monochrome_pipeline,
        };

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glyphcam-frame-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.settings.mode.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (groups_x, groups_y) = self.gpu.dispatch_size(output.width, output.height);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.gpu.queue.submit(Some(encoder.finish()));
        self.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    /// One build attempt per configuration change. A failure keeps the previous atlas
    /// bound and leaves the state stale until the next `configure`.
    fn ensure_atlas(&mut self) {
        if !self.rebuild_pending {
            return;
        }
        self.rebuild_pending = false;
        match GpuAtlas::build(
            &self.gpu.device,
            &self.gpu.queue,
            &self.settings.palette,
            &self.font,
            self.settings.font_size,
        ) {
            Ok(atlas) => {
                info!(
                    "rebuilt glyph atlas: {} at {}px",
                    atlas.key.palette, atlas.key.font_size
                );
                self.atlas = atlas;
                self.atlas_state = AtlasState::Current;
                self.stats.atlas_builds += 1;
            }
            Err(error) => {
                warn!(
                    "atlas rebuild failed, keeping {} at {}px: {error:#}",
                    self.atlas.key.palette, self.atlas.key.font_size
                );
                self.stats.atlas_failures += 1;
            }
        }
    }

    fn ensure_output(&mut self) -> Result<()> {
        let (width, height) = self.output_size;
        if let Some(output) = &self.output {
            if output.width == width && output.height == height {
                return Ok(());
            }
        }
        let max_dimension = self.gpu.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max_dimension || height > max_dimension {
            return Err(anyhow!(
                "output size {width}x{height} is outside 1..={max_dimension}"
            ));
        }

        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("glyphcam-output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        debug!("created output image {}x{}", width, height);
        self.output = Some(OutputImage {
            texture,
            view,
            width,
            height,
        });
        self.stats.output_recreations += 1;
        Ok(())
    }

    fn upload_source(&mut self, source: &SourceImage<'_>) -> Result<()> {
        let (width, height, layout) = (source.width(), source.height(), source.layout());
        let max_dimension = self.gpu.device.limits().max_texture_dimension_2d;
        if width > max_dimension || height > max_dimension {
            return Err(CodedError::frame(
                INVALID_SOURCE_FRAME,
                format!("source {width}x{height} exceeds the device texture limit {max_dimension}"),
            )
            .into());
        }

        let reusable = self.source.as_ref().is_some_and(|current| {
            current.width == width && current.height == height && current.layout == layout
        });
        if !reusable {
            let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("glyphcam-source"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: layout.texture_format(),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            self.source = Some(SourceTexture {
                texture,
                view,
                width,
                height,
                layout,
            });
        }

        let target = self
            .source
            .as_ref()
            .ok_or_else(|| CodedError::frame(INVALID_SOURCE_FRAME, "source view missing"))?;
        self.gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            source.data(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(source.bytes_per_row()),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}
