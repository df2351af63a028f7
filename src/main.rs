use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use glyphcam::config::{load_and_validate_config, PaletteChoice, RenderConfig};
use glyphcam::error_codes::{
    find_coded_error, CodedError, INVALID_CONFIG, INVALID_SOURCE_FRAME,
};
use glyphcam::font_assets::MonospaceFont;
use glyphcam::glyph_atlas::AtlasImage;
use glyphcam::gpu::GpuContext;
use glyphcam::mailbox::FrameMailbox;
use glyphcam::palette::PaletteKind;
use glyphcam::pipeline::{GlyphPipeline, DEFAULT_FONT_SIZE};
use glyphcam::readback::RawFrame;
use glyphcam::session::{CaptureControls, RenderLoop, StepOutcome};
use glyphcam::source::OwnedFrame;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GLYPHCAM_GIT_HASH"),
    ")"
);

#[derive(Debug, Parser)]
#[command(name = "glyphcam")]
#[command(about = "Renders frames as glyph mosaics on the GPU")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render one image through the GPU pipeline.
    Render {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        columns: Option<u32>,
        #[arg(long, value_parser = PaletteKind::parse)]
        palette: Option<PaletteKind>,
        /// Monochrome foreground/background instead of source colors.
        #[arg(long)]
        mono: bool,
        #[arg(long)]
        invert: bool,
        #[arg(long)]
        font: Option<PathBuf>,
    },
    /// Write the glyph atlas strip and its geometry.
    Atlas {
        #[arg(long, value_parser = PaletteKind::parse, default_value = "classic")]
        palette: PaletteKind,
        #[arg(long, default_value_t = DEFAULT_FONT_SIZE)]
        font_size: f32,
        #[arg(long)]
        font: Option<PathBuf>,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
    /// Validate a config file.
    Check {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Render {
            input,
            output,
            config,
            columns,
            palette,
            mono,
            invert,
            font,
        } => {
            let overrides = RenderOverrides {
                columns,
                palette,
                mono,
                invert,
                font,
            };
            run_render(&input, &output, config.as_deref(), overrides)
        }
        Commands::Atlas {
            palette,
            font_size,
            font,
            output,
        } => run_atlas(palette, font_size, font.as_deref(), &output),
        Commands::Check { config, json } => return run_check(&config, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

struct RenderOverrides {
    columns: Option<u32>,
    palette: Option<PaletteKind>,
    mono: bool,
    invert: bool,
    font: Option<PathBuf>,
}

impl RenderOverrides {
    fn apply(self, config: &mut RenderConfig) {
        if let Some(columns) = self.columns {
            config.columns = columns;
        }
        if let Some(palette) = self.palette {
            config.palette = PaletteChoice::Builtin(palette);
        }
        if self.mono {
            config.colored = false;
        }
        if self.invert {
            config.invert = true;
        }
        if self.font.is_some() {
            config.font_path = self.font;
        }
    }
}

fn run_render(
    input: &Path,
    output_path: &Path,
    config_path: Option<&Path>,
    overrides: RenderOverrides,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => load_and_validate_config(path)?,
        None => RenderConfig {
            colored: true,
            ..RenderConfig::default()
        },
    };
    overrides.apply(&mut config);
    config
        .validate()
        .map_err(|error| CodedError::usage(INVALID_CONFIG, format!("{error:#}")))?;

    let frame = image::open(input)
        .with_context(|| format!("failed to read input image {}", input.display()))?
        .to_rgba8();
    let (width, height) = config
        .output
        .map_or(frame.dimensions(), |output| (output.width, output.height));
    let settings = config.settings(width, height)?;
    info!(
        "rendering {} as {}x{} {} glyphs into {}x{}",
        input.display(),
        settings.columns,
        settings.rows,
        settings.palette,
        width,
        height
    );

    let font = MonospaceFont::resolve(config.font_path.as_deref())?;
    let gpu = GpuContext::new_blocking()?;
    let pipeline = GlyphPipeline::new(gpu, font, settings, width, height)?;

    let mailbox = Arc::new(FrameMailbox::new());
    let controls = Arc::new(CaptureControls::new());
    let mut render_loop = RenderLoop::new(
        pipeline,
        Arc::clone(&mailbox),
        Arc::clone(&controls),
        Vec::<RawFrame>::new(),
    );

    mailbox.post(OwnedFrame::from_rgba_image(frame));
    mailbox.close();
    controls.request_capture();

    let mut report = match render_loop.step(Duration::from_secs(5)) {
        StepOutcome::Rendered(report) => report,
        StepOutcome::Skipped => {
            return Err(CodedError::frame(
                INVALID_SOURCE_FRAME,
                format!("frame from {} could not be rendered", input.display()),
            )
            .into())
        }
        StepOutcome::Idle | StepOutcome::Finished => {
            return Err(anyhow!("no frame reached the render loop"))
        }
    };
    if let Some(error) = report.errors.pop() {
        return Err(error);
    }
    let still = report
        .still
        .ok_or_else(|| CodedError::readback("still capture was not serviced"))?;
    still
        .save(output_path)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn run_atlas(
    palette: PaletteKind,
    font_size: f32,
    font_path: Option<&Path>,
    output_path: &Path,
) -> Result<()> {
    let font = MonospaceFont::resolve(font_path)?;
    let atlas = AtlasImage::build(&palette.palette(), &font, font_size)?;
    atlas
        .image
        .save(output_path)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let meta_path = output_path.with_extension("meta.json");
    let meta = serde_json::json!({
        "palette": atlas.key.palette.name(),
        "glyphs": atlas.key.palette.glyphs().iter().collect::<String>(),
        "font": font.path().display().to_string(),
        "font_size": font_size,
        "cell_width": atlas.geometry.cell_width,
        "cell_height": atlas.geometry.cell_height,
        "glyph_count": atlas.geometry.glyph_count,
    });
    fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
        .with_context(|| format!("failed to write {}", meta_path.display()))?;

    println!("Wrote {} and {}", output_path.display(), meta_path.display());
    Ok(())
}

fn run_check(config_path: &Path, json: bool) -> ExitCode {
    match load_and_validate_config(config_path) {
        Ok(config) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "columns": config.columns,
                        "rows": config.rows,
                        "colored": config.colored,
                    })
                );
            } else {
                let rows = config
                    .rows
                    .map_or_else(|| "auto".to_owned(), |rows| rows.to_string());
                println!(
                    "OK: {} ({} columns, {} rows, {})",
                    config_path.display(),
                    config.columns,
                    rows,
                    if config.colored { "colored" } else { "monochrome" }
                );
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            let coded = find_coded_error(&error).cloned().unwrap_or_else(|| {
                CodedError::usage(INVALID_CONFIG, format!("{error:#}"))
            });
            if json {
                match serde_json::to_string_pretty(&coded.envelope()) {
                    Ok(text) => println!("{text}"),
                    Err(_) => eprintln!("error: {error:#}"),
                }
            } else {
                eprintln!("error: {error:#}");
            }
            ExitCode::from(2)
        }
    }
}
