//! Block backend abstraction.
//!
//! Defines the `BlockBackend` trait for positional sector I/O,
//! allowing different implementations (Linux block devices, mock, etc.).

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not found: {path}")]
    DeviceNotFound { path: String },

    #[error("Failed to query geometry of {path}: {message}")]
    GeometryQueryFailed { path: String, message: String },

    #[error("Failed to lock {path}: {message}")]
    DeviceLockFailed { path: String, message: String },

    #[error("I/O error on {path} at offset {offset}: {message}")]
    Io {
        path: String,
        offset: u64,
        message: String,
    },

    #[error("Seek to {target} outside device bounds (size {size})")]
    SeekFailure { target: i128, size: u64 },

    #[error("Device {path} not opened for {operation}")]
    AccessDenied { path: String, operation: &'static str },

    #[error("Device handle already closed")]
    Closed,
}

impl From<DeviceError> for std::io::Error {
    fn from(err: DeviceError) -> Self {
        let kind = match &err {
            DeviceError::DeviceNotFound { .. } => std::io::ErrorKind::NotFound,
            DeviceError::AccessDenied { .. } => std::io::ErrorKind::PermissionDenied,
            DeviceError::SeekFailure { .. } => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Requested access to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::ReadWrite => write!(f, "read/write"),
        }
    }
}

/// Size and transfer granularity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total size in bytes.
    pub size: u64,
    /// Logical sector size in bytes.
    pub sector_size: u32,
}

impl Geometry {
    /// Round `len` up to the next whole number of sectors.
    pub fn round_up(&self, len: u64) -> u64 {
        len.div_ceil(self.sector_size as u64) * self.sector_size as u64
    }

    pub fn is_aligned(&self, value: u64) -> bool {
        value % self.sector_size as u64 == 0
    }
}

/// Abstract raw storage interface.
///
/// Backends only see absolute offsets. Cursor tracking and alignment
/// correction live in [`RawDevice`](super::RawDevice).
pub trait BlockBackend: Send {
    /// Canonical device path, used in logs and errors.
    fn identifier(&self) -> &str;

    /// Geometry discovered when the backend was opened.
    fn geometry(&self) -> Geometry;

    /// Issue one read of `buf.len()` bytes at `offset`.
    ///
    /// Returns fewer bytes only at end-of-device.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Issue one write of `buf.len()` bytes at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError>;

    /// Flush any buffered state to the media.
    fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Force-dismount any filesystem mounted from this device.
    fn dismount(&mut self) -> Result<(), DeviceError>;

    /// Take the exclusive volume lock.
    fn lock(&mut self) -> Result<(), DeviceError>;

    /// Release the exclusive volume lock.
    fn unlock(&mut self) -> Result<(), DeviceError>;
}

impl<B: BlockBackend + ?Sized> BlockBackend for Box<B> {
    fn identifier(&self) -> &str {
        (**self).identifier()
    }

    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        (**self).flush()
    }

    fn dismount(&mut self) -> Result<(), DeviceError> {
        (**self).dismount()
    }

    fn lock(&mut self) -> Result<(), DeviceError> {
        (**self).lock()
    }

    fn unlock(&mut self) -> Result<(), DeviceError> {
        (**self).unlock()
    }
}

/// Normalize a device identifier into a canonical device path.
///
/// Absolute paths are kept as-is; bare names (`nbd0`, `sdb`) live under `/dev`.
pub fn normalize_device_path(identifier: &str) -> String {
    let trimmed = identifier.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/dev/{}", trimmed.trim_start_matches("dev/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_device_path() {
        assert_eq!(normalize_device_path("nbd0"), "/dev/nbd0");
        assert_eq!(normalize_device_path(" sdb "), "/dev/sdb");
        assert_eq!(normalize_device_path("/dev/loop3"), "/dev/loop3");
        assert_eq!(normalize_device_path("/tmp/disk.img"), "/tmp/disk.img");
    }

    #[test]
    fn test_geometry_round_up() {
        let geo = Geometry {
            size: 1 << 20,
            sector_size: 512,
        };
        assert_eq!(geo.round_up(0), 0);
        assert_eq!(geo.round_up(1), 512);
        assert_eq!(geo.round_up(512), 512);
        assert_eq!(geo.round_up(513), 1024);
        assert!(geo.is_aligned(4096));
        assert!(!geo.is_aligned(4097));
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::Read.can_read());
        assert!(!AccessMode::Read.can_write());
        assert!(AccessMode::Write.can_write());
        assert!(!AccessMode::Write.can_read());
        assert!(AccessMode::ReadWrite.can_read() && AccessMode::ReadWrite.can_write());
    }
}
