//! Pipeline error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceError;

/// A variant that did not produce its artifact.
#[derive(Debug, Clone)]
pub struct VariantFailure {
    pub variant: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Missing {what}: {}", .path.display())]
    PrerequisiteMissing { what: String, path: PathBuf },

    #[error("Invalid payload {}: {reason}", .path.display())]
    InvalidPayload { path: PathBuf, reason: String },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("{program} exited with {status}: {stderr}")]
    ExternalToolFailure {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{} variant(s) failed: {}", .failures.len(), join_failures(.failures))]
    VariantsFailed { failures: Vec<VariantFailure> },
}

impl AssemblyError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures detected before anything was touched.
    pub fn is_prerequisite(&self) -> bool {
        matches!(
            self,
            AssemblyError::PrerequisiteMissing { .. } | AssemblyError::InvalidPayload { .. }
        )
    }
}

fn join_failures(failures: &[VariantFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.variant, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
