//! Contracts for the external collaborators the pipeline drives.
//!
//! Everything that is not raw sector I/O is delegated: mounting disk images,
//! running the composition, driver, boot-configuration and packaging tools,
//! and opening the block device behind a mounted image.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::device::{AccessMode, BlockBackend, DeviceError, RawDevice, normalize_device_path};
use crate::error::AssemblyError;

/// Identifier of a mounted disk image, as returned by the mount service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskId(pub String);

impl DiskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonical path of the underlying block device.
    pub fn device_path(&self) -> String {
        normalize_device_path(&self.0)
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual-disk mount service.
///
/// Mounts are non-exclusive: a [`RawDevice`] may be opened on the same media
/// while the image is attached.
pub trait VirtualDiskService: Send + Sync {
    /// Attach `image` and mount its OS volume.
    fn mount(&self, image: &Path) -> Result<DiskId, AssemblyError>;

    /// Unmount and detach `image`.
    fn unmount(&self, image: &Path) -> Result<(), AssemblyError>;

    /// Filesystem path of the OS volume of a mounted disk.
    fn volume_path(&self, disk: &DiskId) -> Result<PathBuf, AssemblyError>;

    /// Mount the EFI system partition of `disk` at `mount_point`.
    fn mount_system_partition(&self, disk: &DiskId, mount_point: &Path)
    -> Result<(), AssemblyError>;

    fn unmount_system_partition(
        &self,
        disk: &DiskId,
        mount_point: &Path,
    ) -> Result<(), AssemblyError>;

    /// External programs this service needs, as `(description, program)`.
    fn prerequisites(&self) -> Vec<(&'static str, PathBuf)> {
        Vec::new()
    }
}

/// Runs an external program to completion.
pub trait ToolRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is `ExternalToolFailure`.
    fn run(&self, program: &Path, args: &[String]) -> Result<(), AssemblyError>;
}

/// Opens the raw device behind a mounted disk.
pub trait DeviceOpener: Send + Sync {
    fn open(
        &self,
        disk: &DiskId,
        mode: AccessMode,
    ) -> Result<RawDevice<Box<dyn BlockBackend>>, DeviceError>;
}

/// Locate `program`: paths with a directory part must exist as given,
/// bare names are searched on `PATH`.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Lossy string form of a path, for tool arguments.
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
