//! Cursor-based raw device handle.
//!
//! Wraps a [`BlockBackend`] with a byte cursor and hides sector alignment
//! from readers. Writes are passed through untouched: callers must issue
//! whole sectors, and a misaligned write is reported by the device rather
//! than silently widened here.

use std::io::{self, SeekFrom};

use tracing::{debug, info, instrument, trace, warn};

use super::traits::{AccessMode, BlockBackend, DeviceError, Geometry};

/// Exclusive, locked access to one device.
///
/// The lock is taken by [`RawDevice::acquire`] and released by
/// [`RawDevice::close`] or on drop, whichever comes first.
pub struct RawDevice<B: BlockBackend> {
    backend: Option<B>,
    path: String,
    geometry: Geometry,
    cursor: u64,
    mode: AccessMode,
}

impl<B: BlockBackend> RawDevice<B> {
    /// Dismount and lock an opened backend.
    ///
    /// Both steps must succeed for the handle to exist. On failure the
    /// backend is dropped before returning, releasing whatever it holds.
    #[instrument(level = "debug", skip(backend), fields(path = backend.identifier()))]
    pub fn acquire(mut backend: B, mode: AccessMode) -> Result<Self, DeviceError> {
        let path = backend.identifier().to_string();
        let geometry = backend.geometry();
        if geometry.sector_size == 0 {
            return Err(DeviceError::GeometryQueryFailed {
                path,
                message: "device reports a zero sector size".into(),
            });
        }

        backend.dismount().map_err(|e| lock_failed(&path, e))?;
        if let Err(e) = backend.lock() {
            return Err(lock_failed(&path, e));
        }

        info!(
            path = %path,
            size = geometry.size,
            sector_size = geometry.sector_size,
            mode = %mode,
            "Device acquired"
        );

        Ok(Self {
            backend: Some(backend),
            path,
            geometry,
            cursor: 0,
            mode,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.geometry.size
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current byte offset.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Read `buf.len()` bytes at the cursor.
    ///
    /// Unaligned requests are widened to whole sectors around the cursor and
    /// the requested window is copied out. The cursor ends after the logical
    /// range. Fewer bytes are returned only at end-of-device.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let geometry = self.geometry;
        let cursor = self.cursor;
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
        if !self.mode.can_read() {
            return Err(DeviceError::AccessDenied {
                path: self.path.clone(),
                operation: "read",
            });
        }

        let count = buf.len();
        if count == 0 {
            return Ok(0);
        }

        if geometry.is_aligned(count as u64) && geometry.is_aligned(cursor) {
            let n = backend.read_at(cursor, buf)?;
            self.cursor = cursor + n as u64;
            trace!(offset = cursor, len = count, read = n, "Aligned read");
            return Ok(n);
        }

        let lead = cursor % geometry.sector_size as u64;
        let start = cursor - lead;
        let span = geometry.round_up(lead + count as u64) as usize;
        let mut scratch = vec![0u8; span];
        let n = backend.read_at(start, &mut scratch)?;

        let lead = lead as usize;
        let available = n.saturating_sub(lead).min(count);
        buf[..available].copy_from_slice(&scratch[lead..lead + available]);
        self.cursor = cursor + available as u64;

        trace!(
            offset = cursor,
            len = count,
            physical_offset = start,
            physical_len = span,
            read = available,
            "Unaligned read"
        );
        Ok(available)
    }

    /// Write `buf` at the cursor as a single device request.
    ///
    /// The length is passed through unchanged. Writes that would extend past
    /// the end of the device are rejected before any I/O, and a short write is
    /// an error. The cursor only moves on success.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let cursor = self.cursor;
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
        if !self.mode.can_write() {
            return Err(DeviceError::AccessDenied {
                path: self.path.clone(),
                operation: "write",
            });
        }

        let end = cursor.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.geometry.size) {
            return Err(DeviceError::Io {
                path: self.path.clone(),
                offset: cursor,
                message: format!(
                    "write of {} bytes passes end of device ({} bytes)",
                    buf.len(),
                    self.geometry.size
                ),
            });
        }

        let n = backend.write_at(cursor, buf)?;
        if n != buf.len() {
            return Err(DeviceError::Io {
                path: self.path.clone(),
                offset: cursor,
                message: format!("short write: {} of {} bytes", n, buf.len()),
            });
        }

        self.cursor = cursor + n as u64;
        trace!(offset = cursor, len = n, "Write complete");
        Ok(n)
    }

    /// Move the cursor.
    ///
    /// Targets outside `[0, size]` fail with `SeekFailure` and leave the
    /// cursor where it was.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, DeviceError> {
        if self.backend.is_none() {
            return Err(DeviceError::Closed);
        }

        let size = self.geometry.size;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.cursor as i128 + delta as i128,
            SeekFrom::End(delta) => size as i128 + delta as i128,
        };

        if target < 0 || target > size as i128 {
            return Err(DeviceError::SeekFailure { target, size });
        }

        self.cursor = target as u64;
        Ok(self.cursor)
    }

    /// Seek with the legacy contract: on failure the previous cursor is
    /// returned and the caller must re-check the position.
    pub fn seek_or_stay(&mut self, pos: SeekFrom) -> u64 {
        match self.seek(pos) {
            Ok(offset) => offset,
            Err(e) => {
                warn!(path = %self.path, error = %e, "Seek failed, cursor unchanged");
                self.cursor
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), DeviceError> {
        self.backend.as_mut().ok_or(DeviceError::Closed)?.flush()
    }

    /// Unlock and release the device.
    ///
    /// Unlock failures are logged and suppressed. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };

        if let Err(e) = backend.flush() {
            debug!(path = %self.path, error = %e, "Flush on close failed");
        }
        if let Err(e) = backend.unlock() {
            debug!(path = %self.path, error = %e, "Unlock failed, ignoring");
        }
        drop(backend);

        info!(path = %self.path, "Device released");
    }
}

impl<B: BlockBackend> Drop for RawDevice<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: BlockBackend> io::Read for RawDevice<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        RawDevice::read(self, buf).map_err(Into::into)
    }
}

impl<B: BlockBackend> io::Write for RawDevice<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RawDevice::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        RawDevice::flush(self).map_err(Into::into)
    }
}

impl<B: BlockBackend> io::Seek for RawDevice<B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        RawDevice::seek(self, pos).map_err(Into::into)
    }
}

fn lock_failed(path: &str, err: DeviceError) -> DeviceError {
    match err {
        DeviceError::DeviceLockFailed { .. } => err,
        other => DeviceError::DeviceLockFailed {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}
