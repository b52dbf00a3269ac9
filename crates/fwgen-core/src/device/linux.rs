//! Linux block device backend.
//!
//! Block devices are opened with `O_DIRECT | O_SYNC` so no page cache sits
//! between the caller and the media. `O_DIRECT` needs sector-aligned memory,
//! so every transfer goes through an aligned bounce buffer of the same length.
//! Regular files (raw image files) are opened `O_SYNC` only.
//!
//! The exclusive claim differs by kind: a block device is reopened with
//! `O_EXCL`, which the kernel refuses while the device is mounted or claimed
//! elsewhere and which blocks new mounts while held. Image files only get an
//! advisory `flock`.

use std::alloc::{self, Layout};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::ptr::NonNull;

use tracing::{debug, info, instrument, warn};

use super::raw::RawDevice;
use super::traits::{AccessMode, BlockBackend, DeviceError, Geometry, normalize_device_path};

/// `_IO(0x12, 104)`
const BLKSSZGET: u64 = 0x1268;
/// `_IOR(0x12, 114, size_t)`
const BLKGETSIZE64: u64 = 0x8008_1272;

/// Sector size assumed for regular image files.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

const MOUNTS_TABLE: &str = "/proc/self/mounts";

/// Raw access to a Linux block device or image file.
pub struct LinuxBlockDevice {
    file: File,
    path: String,
    geometry: Geometry,
    direct: bool,
    is_block: bool,
    locked: bool,
    /// `O_EXCL` descriptor holding the kernel claim on a block device.
    claim: Option<File>,
}

impl LinuxBlockDevice {
    /// Open `identifier` for raw access.
    ///
    /// Geometry is discovered before the device is opened for `mode`.
    #[instrument(level = "debug")]
    pub fn open(identifier: &str, mode: AccessMode) -> Result<Self, DeviceError> {
        let path = normalize_device_path(identifier);

        let metadata = fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DeviceError::DeviceNotFound { path: path.clone() },
            _ => DeviceError::GeometryQueryFailed {
                path: path.clone(),
                message: e.to_string(),
            },
        })?;
        let is_block = metadata.file_type().is_block_device();

        let geometry = if is_block {
            query_block_geometry(&path)?
        } else if metadata.is_file() {
            Geometry {
                size: metadata.len(),
                sector_size: DEFAULT_SECTOR_SIZE,
            }
        } else {
            return Err(DeviceError::GeometryQueryFailed {
                path,
                message: "not a block device or regular file".into(),
            });
        };

        let mut flags = libc::O_SYNC;
        if is_block {
            flags |= libc::O_DIRECT;
        }

        let file = OpenOptions::new()
            .read(mode.can_read())
            .write(mode.can_write())
            .custom_flags(flags)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DeviceError::DeviceNotFound { path: path.clone() },
                _ => DeviceError::Io {
                    path: path.clone(),
                    offset: 0,
                    message: format!("open failed: {}", e),
                },
            })?;

        debug!(
            path = %path,
            block_device = is_block,
            size = geometry.size,
            sector_size = geometry.sector_size,
            "Device opened"
        );

        Ok(Self {
            file,
            path,
            geometry,
            direct: is_block,
            is_block,
            locked: false,
            claim: None,
        })
    }

    fn io_error(&self, offset: u64, err: io::Error) -> DeviceError {
        DeviceError::Io {
            path: self.path.clone(),
            offset,
            message: err.to_string(),
        }
    }

    fn alignment(&self) -> usize {
        (self.geometry.sector_size as usize).max(DEFAULT_SECTOR_SIZE as usize)
    }
}

impl BlockBackend for LinuxBlockDevice {
    fn identifier(&self) -> &str {
        &self.path
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if !self.direct {
            return self.file.read_at(buf, offset).map_err(|e| self.io_error(offset, e));
        }

        let mut bounce = AlignedBuffer::new(buf.len(), self.alignment())
            .map_err(|e| self.io_error(offset, e))?;
        let n = self
            .file
            .read_at(bounce.as_mut_slice(), offset)
            .map_err(|e| self.io_error(offset, e))?;
        buf[..n].copy_from_slice(&bounce.as_slice()[..n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError> {
        if !self.direct {
            return self.file.write_at(buf, offset).map_err(|e| self.io_error(offset, e));
        }

        let mut bounce = AlignedBuffer::new(buf.len(), self.alignment())
            .map_err(|e| self.io_error(offset, e))?;
        bounce.as_mut_slice().copy_from_slice(buf);
        self.file
            .write_at(bounce.as_slice(), offset)
            .map_err(|e| self.io_error(offset, e))
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.file.sync_data().map_err(|e| self.io_error(0, e))
    }

    fn dismount(&mut self) -> Result<(), DeviceError> {
        if !self.is_block {
            return Ok(());
        }

        let table = fs::read_to_string(MOUNTS_TABLE).map_err(|e| DeviceError::DeviceLockFailed {
            path: self.path.clone(),
            message: format!("cannot read {}: {}", MOUNTS_TABLE, e),
        })?;

        for (source, target) in mounted_from(&table, &self.path) {
            info!(source = %source, target = %target, "Force-dismounting volume");
            let c_target = CString::new(target.as_str()).map_err(|e| DeviceError::DeviceLockFailed {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

            // SAFETY: c_target is a valid NUL-terminated path.
            let rc = unsafe { libc::umount2(c_target.as_ptr(), libc::MNT_FORCE) };
            if rc != 0 {
                return Err(DeviceError::DeviceLockFailed {
                    path: self.path.clone(),
                    message: format!("umount {}: {}", target, io::Error::last_os_error()),
                });
            }
        }

        Ok(())
    }

    fn lock(&mut self) -> Result<(), DeviceError> {
        if self.is_block {
            self.claim = Some(claim_exclusive(&self.path)?);
            self.locked = true;
            debug!(path = %self.path, "Exclusive claim taken");
            return Ok(());
        }

        // SAFETY: the descriptor is owned by self.file for the whole call.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(DeviceError::DeviceLockFailed {
                path: self.path.clone(),
                message: io::Error::last_os_error().to_string(),
            });
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), DeviceError> {
        if !self.locked {
            return Ok(());
        }
        if let Some(claim) = self.claim.take() {
            drop(claim);
            self.locked = false;
            return Ok(());
        }

        // SAFETY: as in lock().
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        self.locked = false;
        if rc != 0 {
            let err = io::Error::last_os_error();
            warn!(path = %self.path, error = %err, "flock(LOCK_UN) failed");
            return Err(DeviceError::DeviceLockFailed {
                path: self.path.clone(),
                message: err.to_string(),
            });
        }
        Ok(())
    }
}

impl RawDevice<LinuxBlockDevice> {
    /// Open, dismount and lock a device in one step.
    pub fn open(identifier: &str, mode: AccessMode) -> Result<Self, DeviceError> {
        let backend = LinuxBlockDevice::open(identifier, mode)?;
        RawDevice::acquire(backend, mode)
    }
}

/// Open `path` with `O_EXCL`, claiming the block device for this process.
fn claim_exclusive(path: &str) -> Result<File, DeviceError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
        .map_err(|e| DeviceError::DeviceLockFailed {
            path: path.to_string(),
            message: format!("exclusive open failed: {}", e),
        })
}

fn query_block_geometry(path: &str) -> Result<Geometry, DeviceError> {
    let file = File::open(path).map_err(|e| DeviceError::GeometryQueryFailed {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    let fd = file.as_raw_fd();

    let mut size: u64 = 0;
    let mut sector_size: libc::c_int = 0;

    // SAFETY: both ioctls write a single integer of the declared width.
    let rc = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };
    if rc != 0 {
        return Err(geometry_error(path, "BLKGETSIZE64"));
    }
    let rc = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut sector_size as *mut libc::c_int) };
    if rc != 0 || sector_size <= 0 {
        return Err(geometry_error(path, "BLKSSZGET"));
    }

    Ok(Geometry {
        size,
        sector_size: sector_size as u32,
    })
}

fn geometry_error(path: &str, request: &str) -> DeviceError {
    DeviceError::GeometryQueryFailed {
        path: path.to_string(),
        message: format!("{}: {}", request, io::Error::last_os_error()),
    }
}

/// `(source, target)` pairs of a `/proc/self/mounts` table.
pub(crate) fn parse_mounts(table: &str) -> Vec<(String, String)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape_mount_field(fields.next()?);
            let target = unescape_mount_field(fields.next()?);
            Some((source, target))
        })
        .collect()
}

/// Current mounts of this process's namespace.
pub(crate) fn read_mounts() -> io::Result<Vec<(String, String)>> {
    fs::read_to_string(MOUNTS_TABLE).map(|table| parse_mounts(&table))
}

/// Mounts whose source is `device` or one of its partitions.
fn mounted_from(table: &str, device: &str) -> Vec<(String, String)> {
    parse_mounts(table)
        .into_iter()
        .filter(|(source, _)| source == device || is_partition_of(source, device))
        .collect()
}

/// `/dev/sdb1` and `/dev/nbd0p2` are partitions of `/dev/sdb` and `/dev/nbd0`.
fn is_partition_of(candidate: &str, device: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(device) else {
        return false;
    };
    let digits = rest.strip_prefix('p').unwrap_or(rest);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(code);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Heap buffer aligned for `O_DIRECT` transfers.
struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    fn new(len: usize, align: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(1), align.next_power_of_two())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, len, layout })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() >= len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in new().
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
