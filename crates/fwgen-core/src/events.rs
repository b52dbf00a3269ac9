//! Event system for UI decoupling.
//!
//! The pipeline reports what it is doing through an injected
//! [`AssemblyObserver`] instead of writing to the console, so the CLI and
//! tests can each decide how to present it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::progress::TransferProgress;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Pipeline steps, in the order a variant passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStep {
    /// Checking tools and payloads.
    Prerequisites,
    /// Copying the input disk image into the workspace.
    CopyImage,
    /// Applying the OS image onto a blank disk.
    ApplyImage,
    /// Installing the boot manager into the system partition.
    InstallBootManager,
    /// Raw bootloader transfer.
    WriteBootloader,
    /// Unmount and remount after raw access.
    Remount,
    /// Copying the UEFI payload.
    WriteFirmware,
    /// Supplementary boot-configuration edits.
    ConfigureBoot,
    /// Driver injection.
    InjectDrivers,
    /// Producing the flashable artifact.
    Package,
    /// Deleting temporary state.
    Cleanup,
}

impl fmt::Display for AssemblyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyStep::Prerequisites => write!(f, "Checking prerequisites"),
            AssemblyStep::CopyImage => write!(f, "Copying main image"),
            AssemblyStep::ApplyImage => write!(f, "Applying OS image"),
            AssemblyStep::InstallBootManager => write!(f, "Installing boot manager"),
            AssemblyStep::WriteBootloader => write!(f, "Writing bootloader"),
            AssemblyStep::Remount => write!(f, "Remounting image"),
            AssemblyStep::WriteFirmware => write!(f, "Writing UEFI"),
            AssemblyStep::ConfigureBoot => write!(f, "Configuring supplemental boot"),
            AssemblyStep::InjectDrivers => write!(f, "Adding drivers"),
            AssemblyStep::Package => write!(f, "Making FFU"),
            AssemblyStep::Cleanup => write!(f, "Deleting temporary image"),
        }
    }
}

/// Events emitted by the assembly pipeline.
#[derive(Debug, Clone)]
pub enum AssemblyEvent {
    /// Processing of a variant began.
    VariantStarted { variant: String },
    /// A variant entered a new step.
    Step { variant: String, step: AssemblyStep },
    /// Progress of the current bulk transfer.
    Progress {
        variant: String,
        current: u64,
        total: u64,
        elapsed: Duration,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// An artifact was written.
    ArtifactProduced { variant: String, path: PathBuf },
    /// A variant's processing failed.
    VariantFailed { variant: String, message: String },
    /// All variants processed.
    Complete,
}

/// Observer trait for receiving assembly events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait AssemblyObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &AssemblyEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl AssemblyObserver for NullObserver {
    fn on_event(&self, _event: &AssemblyEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl AssemblyObserver for TracingObserver {
    fn on_event(&self, event: &AssemblyEvent) {
        match event {
            AssemblyEvent::VariantStarted { variant } => {
                tracing::info!(variant = %variant, "Processing variant");
            }
            AssemblyEvent::Step { variant, step } => {
                tracing::info!(variant = %variant, "{}", step);
            }
            AssemblyEvent::Progress {
                variant,
                current,
                total,
                elapsed,
            } => {
                let mut progress = TransferProgress::new(*total);
                progress.advance(*current);
                tracing::debug!(variant = %variant, "{}", progress.render_at(*elapsed));
            }
            AssemblyEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            AssemblyEvent::ArtifactProduced { variant, path } => {
                tracing::info!(variant = %variant, path = %path.display(), "Artifact produced");
            }
            AssemblyEvent::VariantFailed { variant, message } => {
                tracing::error!(variant = %variant, "Variant failed: {}", message);
            }
            AssemblyEvent::Complete => {
                tracing::info!("Assembly complete");
            }
        }
    }
}

/// Observer that keeps every event, for tests and post-run reports.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<AssemblyEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AssemblyEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Steps entered by `variant`, in order.
    pub fn steps(&self, variant: &str) -> Vec<AssemblyStep> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                AssemblyEvent::Step { variant: v, step } if v == variant => Some(*step),
                _ => None,
            })
            .collect()
    }

    pub fn progress_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, AssemblyEvent::Progress { .. }))
            .count()
    }
}

impl AssemblyObserver for RecordingObserver {
    fn on_event(&self, event: &AssemblyEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
