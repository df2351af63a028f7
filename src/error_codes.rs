use std::fmt;

use anyhow::Error;
use serde::Serialize;
use serde_json::Value;

pub const NO_GPU_ADAPTER: &str = "NO_GPU_ADAPTER";
pub const PIPELINE_CREATION_FAILED: &str = "PIPELINE_CREATION_FAILED";
pub const ATLAS_BUILD_FAILED: &str = "ATLAS_BUILD_FAILED";
pub const INVALID_GRID: &str = "INVALID_GRID";
pub const INVALID_SOURCE_FRAME: &str = "INVALID_SOURCE_FRAME";
pub const READBACK_FAILED: &str = "READBACK_FAILED";
pub const INVALID_CONFIG: &str = "INVALID_CONFIG";

/// Mirrors the four recovery classes of the frame pipeline plus CLI usage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodedErrorKind {
    Usage,
    /// Fatal to constructing the pipeline.
    Setup,
    /// The previous atlas stays active.
    AtlasBuild,
    /// The frame is skipped.
    Frame,
    /// The capture or record operation is skipped.
    Readback,
}

#[derive(Debug, Clone)]
pub struct CodedError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
    pub kind: CodedErrorKind,
}

impl CodedError {
    pub fn new(kind: CodedErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            kind,
        }
    }

    pub fn usage(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Usage, code, message)
    }

    pub fn setup(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Setup, code, message)
    }

    pub fn atlas(message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::AtlasBuild, ATLAS_BUILD_FAILED, message)
    }

    pub fn frame(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Frame, code, message)
    }

    pub fn readback(message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Readback, READBACK_FAILED, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the frame pipeline keeps running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind, CodedErrorKind::Setup | CodedErrorKind::Usage)
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code.to_owned(),
                kind: self.kind,
                message: self.message.clone(),
                details: self.details.clone(),
            },
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CodedError {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub kind: CodedErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn find_coded_error(error: &Error) -> Option<&CodedError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CodedError>())
}
