use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error, Result};
use image::RgbaImage;
use log::{debug, warn};

use crate::mailbox::FrameMailbox;
use crate::pipeline::GlyphPipeline;
use crate::readback::RawFrame;
use crate::source::{ChannelLayout, OwnedFrame};

/// Flags set from the UI side and read by the render loop.
#[derive(Debug, Default)]
pub struct CaptureControls {
    capture_requested: AtomicBool,
    recording: AtomicBool,
}

impl CaptureControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_capture(&self) {
        self.capture_requested.store(true, Ordering::Release);
    }

    pub fn capture_pending(&self) -> bool {
        self.capture_requested.load(Ordering::Acquire)
    }

    /// Clears and returns the capture request.
    pub fn take_capture_request(&self) -> bool {
        self.capture_requested.swap(false, Ordering::AcqRel)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }
}

/// Receives raw frames while recording is active, typically a video encoder.
pub trait FrameSink {
    fn push_frame(&mut self, frame: RawFrame) -> Result<()>;
}

impl FrameSink for Vec<RawFrame> {
    fn push_frame(&mut self, frame: RawFrame) -> Result<()> {
        self.push(frame);
        Ok(())
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    /// No frame arrived before the timeout.
    Idle,
    /// The mailbox is closed and drained.
    Finished,
    /// A frame arrived but could not be rendered.
    Skipped,
    Rendered(StepReport),
}

/// What one rendered frame produced beyond the preview.
#[derive(Debug, Default)]
pub struct StepReport {
    pub still: Option<RgbaImage>,
    pub recorded: bool,
    /// Readback or sink failures to show the user. The loop keeps running.
    pub errors: Vec<Error>,
}

pub struct RenderLoop<S> {
    pipeline: GlyphPipeline,
    mailbox: Arc<FrameMailbox<OwnedFrame>>,
    controls: Arc<CaptureControls>,
    sink: S,
    sink_layout: ChannelLayout,
}

impl<S: FrameSink> RenderLoop<S> {
    pub fn new(
        pipeline: GlyphPipeline,
        mailbox: Arc<FrameMailbox<OwnedFrame>>,
        controls: Arc<CaptureControls>,
        sink: S,
    ) -> Self {
        Self {
            pipeline,
            mailbox,
            controls,
            sink,
            sink_layout: ChannelLayout::Rgba8,
        }
    }

    /// Channel order handed to the sink.
    pub fn with_sink_layout(mut self, layout: ChannelLayout) -> Self {
        self.sink_layout = layout;
        self
    }

    pub fn pipeline(&self) -> &GlyphPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut GlyphPipeline {
        &mut self.pipeline
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_parts(self) -> (GlyphPipeline, S) {
        (self.pipeline, self.sink)
    }

    /// Waits up to `timeout` for the newest frame, renders it and services any pending
    /// capture and recording.
    pub fn step(&mut self, timeout: Duration) -> StepOutcome {
        let Some(frame) = self.mailbox.wait_take(timeout) else {
            return if self.mailbox.is_closed() {
                StepOutcome::Finished
            } else {
                StepOutcome::Idle
            };
        };
        let source = match frame.view() {
            Ok(source) => source,
            Err(error) => {
                debug!("dropping malformed frame: {error:#}");
                return StepOutcome::Skipped;
            }
        };

        let layout = self.sink_layout;
        let Some(rendered) = self.pipeline.render_frame(&source) else {
            return StepOutcome::Skipped;
        };

        let mut report = StepReport::default();
        if self.controls.take_capture_request() {
            match rendered.read_as_image().context("still capture failed") {
                Ok(image) => report.still = Some(image),
                Err(error) => {
                    warn!("{error:#}");
                    report.errors.push(error);
                }
            }
        }
        if self.controls.is_recording() {
            let pushed = rendered
                .read_as_raw_frame(layout)
                .and_then(|raw| self.sink.push_frame(raw))
                .context("recording frame failed");
            match pushed {
                Ok(()) => report.recorded = true,
                Err(error) => {
                    warn!("{error:#}");
                    report.errors.push(error);
                }
            }
        }
        StepOutcome::Rendered(report)
    }
}
