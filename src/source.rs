use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use image::RgbaImage;
use serde::Deserialize;

use crate::error_codes::{CodedError, INVALID_SOURCE_FRAME};

/// Byte order of a 4-channel 8-bit pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    #[default]
    Rgba8,
    Bgra8,
}

impl ChannelLayout {
    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            ChannelLayout::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            ChannelLayout::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        }
    }

    /// Byte offsets of the red, green and blue channels within a pixel.
    pub fn rgb_offsets(self) -> [usize; 3] {
        match self {
            ChannelLayout::Rgba8 => [0, 1, 2],
            ChannelLayout::Bgra8 => [2, 1, 0],
        }
    }
}

/// Rewrites tightly packed pixels from one channel layout to another in place.
pub fn reorder_channels(pixels: &mut [u8], from: ChannelLayout, to: ChannelLayout) {
    if from == to {
        return;
    }
    // Both layouts keep green and alpha in place; only red and blue trade slots.
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

/// Data the capture layer attaches to a frame and expects back on raw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMetadata {
    pub frame_index: Option<u64>,
    pub presentation_time: Option<Duration>,
}

/// Borrowed, read-only view of one caller-owned video frame.
///
/// Lives for a single render call; the pipeline copies what it needs and keeps no reference.
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    bytes_per_row: u32,
    layout: ChannelLayout,
    pub metadata: FrameMetadata,
}

impl<'a> SourceImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, layout: ChannelLayout) -> Result<Self> {
        let bytes_per_row = width
            .checked_mul(4)
            .ok_or_else(|| anyhow!("source width {width} overflows row size"))?;
        Self::with_stride(data, width, height, bytes_per_row, layout)
    }

    /// View over a frame whose rows are padded to `bytes_per_row`.
    pub fn with_stride(
        data: &'a [u8],
        width: u32,
        height: u32,
        bytes_per_row: u32,
        layout: ChannelLayout,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CodedError::frame(
                INVALID_SOURCE_FRAME,
                format!("source frame must be non-empty, got {width}x{height}"),
            )
            .into());
        }
        if u64::from(bytes_per_row) < u64::from(width) * 4 {
            bail!("row stride {bytes_per_row} is smaller than {width} RGBA pixels");
        }
        let required = u64::from(bytes_per_row) * u64::from(height - 1) + u64::from(width) * 4;
        if (data.len() as u64) < required {
            return Err(CodedError::frame(
                INVALID_SOURCE_FRAME,
                format!(
                    "source frame {width}x{height} needs {required} bytes, got {}",
                    data.len()
                ),
            )
            .into());
        }
        Ok(Self {
            data,
            width,
            height,
            bytes_per_row,
            layout,
            metadata: FrameMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.bytes_per_row
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Normalized RGB of the pixel at `(x, y)` regardless of layout.
    pub fn rgb(&self, x: u32, y: u32) -> [f32; 3] {
        let offset = (y * self.bytes_per_row + x * 4) as usize;
        let [r, g, b] = self.layout.rgb_offsets();
        [
            f32::from(self.data[offset + r]) / 255.0,
            f32::from(self.data[offset + g]) / 255.0,
            f32::from(self.data[offset + b]) / 255.0,
        ]
    }
}

/// Owned copy of a frame, used where a frame must outlive the producer's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub layout: ChannelLayout,
    pub data: Vec<u8>,
    pub metadata: FrameMetadata,
}

impl OwnedFrame {
    pub fn from_source(source: &SourceImage<'_>) -> Self {
        Self {
            width: source.width,
            height: source.height,
            bytes_per_row: source.bytes_per_row,
            layout: source.layout,
            data: source.data.to_vec(),
            metadata: source.metadata,
        }
    }

    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            bytes_per_row: width * 4,
            layout: ChannelLayout::Rgba8,
            data: image.into_raw(),
            metadata: FrameMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn view(&self) -> Result<SourceImage<'_>> {
        Ok(SourceImage::with_stride(
            &self.data,
            self.width,
            self.height,
            self.bytes_per_row,
            self.layout,
        )?
        .with_metadata(self.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_and_rgba_views_read_the_same_color() {
        let rgba = [10u8, 20, 30, 255];
        let bgra = [30u8, 20, 10, 255];
        let a = SourceImage::new(&rgba, 1, 1, ChannelLayout::Rgba8).unwrap();
        let b = SourceImage::new(&bgra, 1, 1, ChannelLayout::Bgra8).unwrap();
        assert_eq!(a.rgb(0, 0), b.rgb(0, 0));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let data = vec![0u8; 15];
        assert!(SourceImage::new(&data, 2, 2, ChannelLayout::Rgba8).is_err());
        assert!(SourceImage::new(&data, 0, 2, ChannelLayout::Rgba8).is_err());
    }

    #[test]
    fn padded_rows_are_addressed_by_stride() {
        // Two rows of one pixel each, padded to 8 bytes per row.
        let data = [0, 0, 0, 255, 9, 9, 9, 9, 255, 255, 255, 255];
        let view = SourceImage::with_stride(&data, 1, 2, 8, ChannelLayout::Rgba8).unwrap();
        assert_eq!(view.rgb(0, 0), [0.0, 0.0, 0.0]);
        assert_eq!(view.rgb(0, 1), [1.0, 1.0, 1.0]);
    }

    #[test]
    fn reorder_swaps_red_and_blue_only_when_layouts_differ() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6, 7, 8];
        reorder_channels(&mut pixels, ChannelLayout::Rgba8, ChannelLayout::Rgba8);
        assert_eq!(pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        reorder_channels(&mut pixels, ChannelLayout::Rgba8, ChannelLayout::Bgra8);
        assert_eq!(pixels, vec![3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn owned_frame_round_trips_metadata_through_view() {
        let metadata = FrameMetadata {
            frame_index: Some(7),
            presentation_time: Some(Duration::from_millis(233)),
        };
        let frame = OwnedFrame::from_rgba_image(RgbaImage::new(2, 2)).with_metadata(metadata);
        assert_eq!(frame.view().unwrap().metadata, metadata);
    }
}
