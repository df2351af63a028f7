pub mod config;
pub mod error_codes;
pub mod font_assets;
pub mod glyph_atlas;
pub mod gpu;
pub mod kernel;
pub mod mailbox;
pub mod palette;
pub mod pipeline;
pub mod readback;
pub mod session;
pub mod source;

pub use pipeline::{GlyphPipeline, RenderSettings};
