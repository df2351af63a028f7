use std::sync::Arc;
use std::time::Duration;

use glyphcam::error_codes::{find_coded_error, NO_GPU_ADAPTER};
use glyphcam::font_assets::MonospaceFont;
use glyphcam::glyph_atlas::AtlasImage;
use glyphcam::gpu::GpuContext;
use glyphcam::kernel::{render_reference, KernelMode};
use glyphcam::mailbox::FrameMailbox;
use glyphcam::palette::Palette;
use glyphcam::pipeline::{AtlasState, GlyphPipeline, RenderSettings};
use glyphcam::readback::RawFrame;
use glyphcam::session::{CaptureControls, RenderLoop, StepOutcome};
use glyphcam::source::{ChannelLayout, FrameMetadata, OwnedFrame, SourceImage};
use image::RgbaImage;

const WHITE_ON_BLACK: KernelMode = KernelMode::Monochrome {
    foreground: [1.0, 1.0, 1.0, 1.0],
    background: [0.0, 0.0, 0.0, 1.0],
};

fn load_font() -> Option<MonospaceFont> {
    match MonospaceFont::resolve(None) {
        Ok(font) => Some(font),
        Err(e) => {
            eprintln!("Skipping test: {e:#}");
            None
        }
    }
}

fn pipeline(settings: RenderSettings, width: u32, height: u32) -> Option<GlyphPipeline> {
    let font = load_font()?;
    let gpu = match GpuContext::new_blocking() {
        Ok(gpu) => gpu,
        Err(e) => {
            if find_coded_error(&e).is_some_and(|coded| coded.code == NO_GPU_ADAPTER) {
                eprintln!("Skipping test: no GPU adapter found");
                return None;
            }
            panic!("GPU context failed to initialize: {e:?}");
        }
    };
    Some(GlyphPipeline::new(gpu, font, settings, width, height).expect("pipeline should build"))
}

fn black_white_source() -> Vec<u8> {
    vec![0, 0, 0, 255, 255, 255, 255, 255]
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                ((x + y) * 255 / (width + height)) as u8,
                255,
            ]);
        }
    }
    data
}

fn half_has_ink(image: &RgbaImage, left: bool) -> bool {
    let mid = image.width() / 2;
    image
        .enumerate_pixels()
        .filter(|(x, _, _)| (*x < mid) == left)
        .any(|(_, _, pixel)| pixel[0] > 0)
}

fn grid_settings(columns: u32, rows: u32, mode: KernelMode, invert: bool) -> RenderSettings {
    RenderSettings {
        columns,
        rows,
        palette: Palette::classic(),
        mode,
        invert,
        ..RenderSettings::default()
    }
}

#[test]
fn black_and_white_cells_pick_the_ramp_ends() {
    let Some(mut pipeline) = pipeline(grid_settings(2, 1, WHITE_ON_BLACK, false), 64, 32) else {
        return;
    };
    let data = black_white_source();
    let source = SourceImage::new(&data, 2, 1, ChannelLayout::Rgba8).unwrap();

    let image = pipeline
        .render_frame(&source)
        .expect("frame should render")
        .read_as_image()
        .expect("readback should succeed");
    assert_eq!(image.dimensions(), (64, 32));
    assert!(!half_has_ink(&image, true), "black cell should be a blank glyph");
    assert!(half_has_ink(&image, false), "white cell should be the heaviest glyph");

    pipeline.configure(grid_settings(2, 1, WHITE_ON_BLACK, true));
    let inverted = pipeline
        .render_frame(&source)
        .expect("frame should render")
        .read_as_image()
        .expect("readback should succeed");
    assert!(half_has_ink(&inverted, true));
    assert!(!half_has_ink(&inverted, false));
    assert_eq!(pipeline.stats().atlas_builds, 1, "invert must not rebuild the atlas");
}

#[test]
fn monochrome_output_only_blends_foreground_over_background() {
    let mode = KernelMode::Monochrome {
        foreground: [0.0, 1.0, 0.0, 1.0],
        background: [0.0, 0.0, 0.0, 1.0],
    };
    let Some(mut pipeline) = pipeline(grid_settings(20, 10, mode, false), 160, 160) else {
        return;
    };
    let data = gradient(40, 40);
    let source = SourceImage::new(&data, 40, 40, ChannelLayout::Rgba8).unwrap();
    let image = pipeline
        .render_frame(&source)
        .expect("frame should render")
        .read_as_image()
        .expect("readback should succeed");

    assert!(image
        .pixels()
        .all(|pixel| pixel[0] == 0 && pixel[2] == 0 && pixel[3] == 255));
    assert!(image.pixels().any(|pixel| pixel[1] == 0));
    assert!(image.pixels().any(|pixel| pixel[1] > 200));
}

#[test]
fn gpu_output_matches_cpu_reference() {
    let settings = grid_settings(40, 15, KernelMode::Colored, false);
    let Some(mut pipeline) = pipeline(settings.clone(), 320, 180) else {
        return;
    };
    let data = gradient(160, 90);
    let source = SourceImage::new(&data, 160, 90, ChannelLayout::Rgba8).unwrap();
    let gpu_image = pipeline
        .render_frame(&source)
        .expect("frame should render")
        .read_as_image()
        .expect("readback should succeed");

    let font = load_font().expect("font loaded above");
    let atlas = AtlasImage::build(&settings.palette, &font, settings.font_size).unwrap();
    let uniforms = pipeline.uniforms_for(160, 90);
    let cpu_image = render_reference(&source, &atlas, &uniforms, KernelMode::Colored).unwrap();

    let differing = gpu_image
        .pixels()
        .zip(cpu_image.pixels())
        .filter(|(gpu, cpu)| {
            gpu.0
                .iter()
                .zip(cpu.0.iter())
                .any(|(a, b)| a.abs_diff(*b) > 2)
        })
        .count();
    let total = (320 * 180) as usize;
    assert!(
        differing * 100 < total,
        "{differing} of {total} pixels differ from the reference"
    );
}

#[test]
fn same_output_size_does_not_recreate_the_output() {
    let Some(mut pipeline) = pipeline(grid_settings(8, 4, WHITE_ON_BLACK, false), 64, 32) else {
        return;
    };
    let data = gradient(16, 16);
    let source = SourceImage::new(&data, 16, 16, ChannelLayout::Rgba8).unwrap();

    assert!(pipeline.render_frame(&source).is_some());
    pipeline.set_output_size(64, 32);
    pipeline.set_output_size(64, 32);
    assert!(pipeline.render_frame(&source).is_some());
    assert_eq!(pipeline.stats().output_recreations, 1);

    pipeline.set_output_size(96, 48);
    let rendered = pipeline.render_frame(&source).expect("frame should render");
    assert_eq!(rendered.output().width(), 96);
    assert_eq!(rendered.output().height(), 48);
    drop(rendered);
    assert_eq!(pipeline.stats().output_recreations, 2);
}

#[test]
fn failed_atlas_rebuild_keeps_the_previous_atlas() {
    let Some(mut pipeline) = pipeline(grid_settings(8, 4, WHITE_ON_BLACK, false), 64, 32) else {
        return;
    };
    let data = gradient(16, 16);
    let source = SourceImage::new(&data, 16, 16, ChannelLayout::Rgba8).unwrap();
    assert!(pipeline.render_frame(&source).is_some());

    // Far wider than any device allows for a single-row strip.
    let oversized = Palette::custom(&".".repeat(4000)).unwrap();
    pipeline.configure(RenderSettings {
        palette: oversized,
        ..grid_settings(8, 4, WHITE_ON_BLACK, false)
    });
    assert_eq!(pipeline.atlas_state(), AtlasState::Stale);

    assert!(pipeline.render_frame(&source).is_some(), "render continues on the old atlas");
    assert_eq!(pipeline.atlas_state(), AtlasState::Stale);
    assert_eq!(pipeline.atlas_palette(), &Palette::classic());
    assert_eq!(pipeline.atlas_geometry().glyph_count, 10);
    assert_eq!(pipeline.stats().atlas_failures, 1);

    assert!(pipeline.render_frame(&source).is_some());
    assert_eq!(pipeline.stats().atlas_failures, 1, "no retry without a new configuration");

    pipeline.configure(grid_settings(8, 4, WHITE_ON_BLACK, false));
    assert_eq!(pipeline.atlas_state(), AtlasState::Current);
    assert!(pipeline.render_frame(&source).is_some());
    assert_eq!(pipeline.stats().atlas_builds, 1);
}

#[test]
fn zero_grid_skips_the_frame() {
    let Some(mut pipeline) = pipeline(grid_settings(0, 4, WHITE_ON_BLACK, false), 64, 32) else {
        return;
    };
    let data = gradient(16, 16);
    let source = SourceImage::new(&data, 16, 16, ChannelLayout::Rgba8).unwrap();
    assert!(pipeline.render_frame(&source).is_none());
    assert_eq!(pipeline.stats().frames_skipped, 1);
    assert_eq!(pipeline.stats().frames_rendered, 0);
}

#[test]
fn bgra_sources_render_like_rgba_sources() {
    let settings = grid_settings(8, 4, KernelMode::Colored, false);
    let Some(mut pipeline) = pipeline(settings, 64, 32) else {
        return;
    };
    let rgba = gradient(16, 16);
    let mut bgra = rgba.clone();
    for pixel in bgra.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }

    let from_rgba = pipeline
        .render_frame(&SourceImage::new(&rgba, 16, 16, ChannelLayout::Rgba8).unwrap())
        .expect("frame should render")
        .read_as_image()
        .unwrap();
    let from_bgra = pipeline
        .render_frame(&SourceImage::new(&bgra, 16, 16, ChannelLayout::Bgra8).unwrap())
        .expect("frame should render")
        .read_as_image()
        .unwrap();
    assert_eq!(from_rgba, from_bgra);
}

#[test]
fn raw_frames_carry_metadata_and_requested_layout() {
    let Some(mut pipeline) = pipeline(grid_settings(8, 4, KernelMode::Colored, false), 64, 32)
    else {
        return;
    };
    let data = gradient(16, 16);
    let metadata = FrameMetadata {
        frame_index: Some(7),
        presentation_time: Some(Duration::from_millis(233)),
    };
    let source = SourceImage::new(&data, 16, 16, ChannelLayout::Rgba8)
        .unwrap()
        .with_metadata(metadata);

    let rendered = pipeline.render_frame(&source).expect("frame should render");
    let image = rendered.read_as_image().unwrap();
    let raw = rendered.read_as_raw_frame(ChannelLayout::Bgra8).unwrap();

    assert_eq!(raw.metadata, metadata);
    assert_eq!((raw.width, raw.height, raw.bytes_per_row), (64, 32, 256));
    assert_eq!(raw.layout, ChannelLayout::Bgra8);
    for (bgra, rgba) in raw.data.chunks_exact(4).zip(image.pixels()) {
        assert_eq!([bgra[2], bgra[1], bgra[0], bgra[3]], rgba.0);
    }
}

#[test]
fn render_loop_services_capture_and_recording() {
    let Some(pipeline) = pipeline(grid_settings(8, 4, WHITE_ON_BLACK, false), 64, 32) else {
        return;
    };
    let mailbox = Arc::new(FrameMailbox::new());
    let controls = Arc::new(CaptureControls::new());
    let mut render_loop = RenderLoop::new(
        pipeline,
        Arc::clone(&mailbox),
        Arc::clone(&controls),
        Vec::<RawFrame>::new(),
    );

    assert!(matches!(
        render_loop.step(Duration::from_millis(1)),
        StepOutcome::Idle
    ));

    let frame = OwnedFrame::from_rgba_image(RgbaImage::from_raw(16, 16, gradient(16, 16)).unwrap());
    mailbox.post(frame.clone().with_metadata(FrameMetadata {
        frame_index: Some(1),
        presentation_time: None,
    }));
    // Overwrites the unconsumed frame.
    mailbox.post(frame.with_metadata(FrameMetadata {
        frame_index: Some(2),
        presentation_time: None,
    }));
    controls.request_capture();
    controls.set_recording(true);

    match render_loop.step(Duration::from_secs(1)) {
        StepOutcome::Rendered(report) => {
            assert!(report.errors.is_empty(), "{:?}", report.errors);
            assert_eq!(report.still.expect("still captured").dimensions(), (64, 32));
            assert!(report.recorded);
        }
        other => panic!("expected a rendered frame, got {other:?}"),
    }
    assert!(!controls.capture_pending(), "capture request is cleared once serviced");
    assert_eq!(mailbox.dropped(), 1);

    mailbox.close();
    assert!(matches!(
        render_loop.step(Duration::from_millis(1)),
        StepOutcome::Finished
    ));

    let (pipeline, recorded) = render_loop.into_parts();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].metadata.frame_index, Some(2));
    assert_eq!(pipeline.stats().frames_rendered, 1);
}
