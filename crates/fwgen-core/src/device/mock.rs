//! Mock block backend for testing.

use std::sync::{Arc, Mutex};

use super::traits::{BlockBackend, DeviceError, Geometry};

/// One backend-level transfer, as issued by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRecord {
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Default)]
struct MockMedia {
    data: Vec<u8>,
    reads: Vec<IoRecord>,
    writes: Vec<IoRecord>,
    locked: bool,
    lock_count: usize,
    unlock_count: usize,
    dismount_count: usize,
    fail_dismount: bool,
    fail_lock: bool,
    fail_unlock: bool,
    fail_writes: bool,
}

/// In-memory block device.
///
/// Clones share the same media so tests can keep a handle for inspection
/// after the backend has been moved into a [`RawDevice`](super::RawDevice).
#[derive(Debug, Clone)]
pub struct MockBlockDevice {
    identifier: String,
    sector_size: u32,
    media: Arc<Mutex<MockMedia>>,
}

impl MockBlockDevice {
    pub fn new(size: usize, sector_size: u32) -> Self {
        Self::with_data(vec![0u8; size], sector_size)
    }

    /// Media pre-filled with `data`.
    pub fn with_data(data: Vec<u8>, sector_size: u32) -> Self {
        Self {
            identifier: "/dev/mock0".to_string(),
            sector_size,
            media: Arc::new(Mutex::new(MockMedia {
                data,
                ..Default::default()
            })),
        }
    }

    /// Snapshot of the media contents.
    pub fn data(&self) -> Vec<u8> {
        self.media.lock().unwrap().data.clone()
    }

    /// All reads issued to the backend.
    pub fn reads(&self) -> Vec<IoRecord> {
        self.media.lock().unwrap().reads.clone()
    }

    /// All writes issued to the backend.
    pub fn writes(&self) -> Vec<IoRecord> {
        self.media.lock().unwrap().writes.clone()
    }

    pub fn clear_log(&self) {
        let mut media = self.media.lock().unwrap();
        media.reads.clear();
        media.writes.clear();
    }

    pub fn is_locked(&self) -> bool {
        self.media.lock().unwrap().locked
    }

    pub fn lock_count(&self) -> usize {
        self.media.lock().unwrap().lock_count
    }

    pub fn unlock_count(&self) -> usize {
        self.media.lock().unwrap().unlock_count
    }

    pub fn dismount_count(&self) -> usize {
        self.media.lock().unwrap().dismount_count
    }

    /// Simulate a volume that refuses to dismount.
    pub fn fail_dismount(&self, fail: bool) {
        self.media.lock().unwrap().fail_dismount = fail;
    }

    /// Simulate another process holding the volume lock.
    pub fn fail_lock(&self, fail: bool) {
        self.media.lock().unwrap().fail_lock = fail;
    }

    pub fn fail_unlock(&self, fail: bool) {
        self.media.lock().unwrap().fail_unlock = fail;
    }

    /// Simulate media errors on every write.
    pub fn fail_writes(&self, fail: bool) {
        self.media.lock().unwrap().fail_writes = fail;
    }
}

impl BlockBackend for MockBlockDevice {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            size: self.media.lock().unwrap().data.len() as u64,
            sector_size: self.sector_size,
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut media = self.media.lock().unwrap();
        media.reads.push(IoRecord {
            offset,
            len: buf.len(),
        });

        let size = media.data.len();
        let start = (offset as usize).min(size);
        let n = buf.len().min(size - start);
        buf[..n].copy_from_slice(&media.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError> {
        let mut media = self.media.lock().unwrap();
        if media.fail_writes {
            return Err(DeviceError::Io {
                path: self.identifier.clone(),
                offset,
                message: "simulated media error".into(),
            });
        }
        media.writes.push(IoRecord {
            offset,
            len: buf.len(),
        });

        let size = media.data.len();
        let start = (offset as usize).min(size);
        let n = buf.len().min(size - start);
        media.data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn dismount(&mut self) -> Result<(), DeviceError> {
        let mut media = self.media.lock().unwrap();
        if media.fail_dismount {
            return Err(DeviceError::DeviceLockFailed {
                path: self.identifier.clone(),
                message: "volume busy".into(),
            });
        }
        media.dismount_count += 1;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), DeviceError> {
        let mut media = self.media.lock().unwrap();
        if media.fail_lock || media.locked {
            return Err(DeviceError::DeviceLockFailed {
                path: self.identifier.clone(),
                message: "lock held by another handle".into(),
            });
        }
        media.locked = true;
        media.lock_count += 1;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), DeviceError> {
        let mut media = self.media.lock().unwrap();
        media.unlock_count += 1;
        if media.fail_unlock {
            return Err(DeviceError::DeviceLockFailed {
                path: self.identifier.clone(),
                message: "unlock rejected".into(),
            });
        }
        media.locked = false;
        Ok(())
    }
}
