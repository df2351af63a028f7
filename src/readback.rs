use std::sync::mpsc;

use anyhow::{anyhow, Result};

use crate::error_codes::CodedError;
use crate::gpu::GpuContext;
use crate::source::{reorder_channels, ChannelLayout, FrameMetadata};

/// CPU copy of one rendered frame for a video encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub layout: ChannelLayout,
    pub data: Vec<u8>,
    pub metadata: FrameMetadata,
}

/// Allocates a zeroed buffer of `len` bytes, reporting allocation failure instead of aborting.
pub fn allocate_frame_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|error| CodedError::readback(format!("cannot allocate {len} bytes: {error}")))?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// Copies a `width × height` RGBA8 texture back to the CPU, tightly packed.
///
/// Blocks until the copy has completed.
pub fn read_texture(
    gpu: &GpuContext,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let unpadded_bytes_per_row = width
        .checked_mul(4)
        .ok_or_else(|| anyhow!("frame width overflow when computing row bytes"))?;
    let padded_bytes_per_row = align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let readback_size = u64::from(padded_bytes_per_row) * u64::from(height);

    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let readback_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("glyphcam-readback-buffer"),
        size: readback_size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    if let Some(error) = pollster::block_on(gpu.device.pop_error_scope()) {
        return Err(CodedError::readback(format!("readback buffer allocation failed: {error}")).into());
    }

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glyphcam-readback-encoder"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &readback_buffer,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(Some(encoder.finish()));

    let buffer_slice = readback_buffer.slice(..);
    let (sender, receiver) = mpsc::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);

    receiver
        .recv()
        .map_err(|_| CodedError::readback("failed receiving GPU map callback"))?
        .map_err(|error| CodedError::readback(format!("GPU buffer mapping failed: {error}")))?;

    let mapped = buffer_slice.get_mapped_range();
    let mut frame = allocate_frame_buffer((unpadded_bytes_per_row * height) as usize)?;
    unpad_rows(
        &mapped,
        &mut frame,
        padded_bytes_per_row as usize,
        unpadded_bytes_per_row as usize,
    );

    drop(mapped);
    readback_buffer.unmap();
    Ok(frame)
}

/// Reads a texture and rewrites its channel order for the consumer.
pub fn read_texture_as(
    gpu: &GpuContext,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
    stored: ChannelLayout,
    wanted: ChannelLayout,
) -> Result<Vec<u8>> {
    let mut pixels = read_texture(gpu, texture, width, height)?;
    reorder_channels(&mut pixels, stored, wanted);
    Ok(pixels)
}

/// Drops the per-row alignment padding of a GPU copy.
pub fn unpad_rows(padded: &[u8], out: &mut [u8], padded_row: usize, unpadded_row: usize) {
    for (src, dst) in padded
        .chunks(padded_row)
        .zip(out.chunks_exact_mut(unpadded_row))
    {
        dst.copy_from_slice(&src[..unpadded_row]);
    }
}

pub fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}
