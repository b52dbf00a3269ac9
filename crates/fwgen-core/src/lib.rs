//! fwgen-core: raw block device access and FFU image assembly.
//!
//! This crate builds flashable firmware images for a family of mobile
//! devices by combining a base OS disk image with per-device bootloader,
//! UEFI, boot-configuration and driver payloads.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Device**: Sector-aligned raw block device access with exclusive locking
//! - **Profile**: Compiled-in table of device variants
//! - **Tools**: Seams for the mount service, external tools and device opener
//! - **Workspace**: Scoped guards for temporary images and mounts
//! - **Events**: Observer pattern for UI decoupling
//! - **Pipeline**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use fwgen_core::config::{ArtifactOptions, Toolchain};
//! use fwgen_core::pipeline::{Assembler, Collaborators};
//!
//! let toolchain = Toolchain::default();
//! let collaborators = Collaborators::system(&toolchain);
//! let assembler = Assembler::new(toolchain, collaborators);
//!
//! let options = ArtifactOptions {
//!     input: "base.vhdx".into(),
//!     output_dir: "out".into(),
//!     driver_pack: "drivers".into(),
//!     version: "10.0.15063.0".into(),
//! };
//! assembler.build_artifacts(&options).expect("assembly failed");
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod tools;
pub mod workspace;

// Re-exports for convenience
pub use config::{ArtifactOptions, BaseImageOptions, MediaArtifactOptions, Toolchain};
pub use device::{AccessMode, BlockBackend, DeviceError, MockBlockDevice, RawDevice};
pub use error::{AssemblyError, VariantFailure};
pub use events::{AssemblyEvent, AssemblyObserver, AssemblyStep, LogLevel, NullObserver, TracingObserver};
pub use pipeline::{Assembler, AssemblySummary, Collaborators, Flow};
pub use profile::{DeviceProfile, PROFILES, enabled_profiles, find_profile, normalize_version};
pub use progress::TransferProgress;
pub use tools::{DiskId, ToolRunner, VirtualDiskService};
