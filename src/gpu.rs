use anyhow::{Context, Result};
use log::info;

use crate::error_codes::{CodedError, NO_GPU_ADAPTER};

/// Preferred workgroup edge; the effective tile is clamped to device limits.
pub const DEFAULT_TILE: u32 = 16;

/// Device and queue shared by every pipeline stage.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    tile: u32,
}

impl GpuContext {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| CodedError::setup(NO_GPU_ADAPTER, "no suitable GPU adapter found"))?;

        let adapter_info = adapter.get_info();
        info!(
            "using GPU adapter '{}' ({:?}, {:?})",
            adapter_info.name, adapter_info.device_type, adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("glyphcam-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .context("failed to request wgpu device")?;

        let tile = tile_for_limits(&device.limits(), DEFAULT_TILE);
        Ok(Self {
            device,
            queue,
            adapter_info,
            tile,
        })
    }

    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    pub fn tile(&self) -> u32 {
        self.tile
    }

    /// Workgroup counts covering a `width × height` grid; the last row and column may overhang.
    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(self.tile), height.div_ceil(self.tile))
    }
}

/// Largest square tile no wider than `preferred` that fits the workgroup limits.
pub fn tile_for_limits(limits: &wgpu::Limits, preferred: u32) -> u32 {
    let mut tile = preferred
        .min(limits.max_compute_workgroup_size_x)
        .min(limits.max_compute_workgroup_size_y)
        .max(1);
    while tile > 1 && tile * tile > limits.max_compute_invocations_per_workgroup {
        tile -= 1;
    }
    tile
}
