//! In-memory collaborators for testing the pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{DeviceOpener, DiskId, ToolRunner, VirtualDiskService};
use crate::device::{AccessMode, BlockBackend, DeviceError, MockBlockDevice, RawDevice};
use crate::error::AssemblyError;

/// One recorded tool invocation.
pub type ToolCall = (PathBuf, Vec<String>);

/// Tool runner that records invocations instead of running anything.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolCall>>,
    fail_program: Mutex<Option<PathBuf>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every invocation of `program` fail.
    pub fn fail_on(&self, program: impl Into<PathBuf>) {
        *self.fail_program.lock().unwrap() = Some(program.into());
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of every invocation of `program`.
    pub fn calls_to(&self, program: &Path) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl ToolRunner for RecordingRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<(), AssemblyError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));

        if self.fail_program.lock().unwrap().as_deref() == Some(program) {
            return Err(AssemblyError::ExternalToolFailure {
                program: program.display().to_string(),
                status: "exit status: 1".into(),
                stderr: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

/// Mount-service call, as seen by [`MockDiskService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskCall {
    Mount(PathBuf),
    Unmount(PathBuf),
    MountSystem(PathBuf),
    UnmountSystem(PathBuf),
}

/// Mount service whose "volume" is a plain directory.
pub struct MockDiskService {
    disk: DiskId,
    volume: PathBuf,
    calls: Mutex<Vec<DiskCall>>,
    mounted: Mutex<Vec<PathBuf>>,
    mounts_allowed: Mutex<Option<usize>>,
}

impl MockDiskService {
    /// Volumes resolve to `volume`, which is created on first mount.
    pub fn new(volume: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskId::new("mock0"),
            volume: volume.into(),
            calls: Mutex::new(Vec::new()),
            mounted: Mutex::new(Vec::new()),
            mounts_allowed: Mutex::new(None),
        }
    }

    /// Let the next `successes` mounts through and fail every one after.
    pub fn fail_mounts_after(&self, successes: usize) {
        *self.mounts_allowed.lock().unwrap() = Some(successes);
    }

    pub fn calls(&self) -> Vec<DiskCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Images currently attached.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().unwrap().clone()
    }

    pub fn mount_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DiskCall::Mount(_)))
            .count()
    }
}

impl VirtualDiskService for MockDiskService {
    fn mount(&self, image: &Path) -> Result<DiskId, AssemblyError> {
        self.calls
            .lock()
            .unwrap()
            .push(DiskCall::Mount(image.to_path_buf()));
        let mut allowed = self.mounts_allowed.lock().unwrap();
        if *allowed == Some(0) {
            return Err(AssemblyError::ExternalToolFailure {
                program: "mount".into(),
                status: "exit status: 32".into(),
                stderr: "simulated mount failure".into(),
            });
        }
        if !image.is_file() {
            return Err(AssemblyError::io(
                format!("attaching {}", image.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        fs::create_dir_all(&self.volume)
            .map_err(|e| AssemblyError::io("creating mock volume", e))?;
        if let Some(n) = allowed.as_mut() {
            *n -= 1;
        }
        self.mounted.lock().unwrap().push(image.to_path_buf());
        Ok(self.disk.clone())
    }

    fn unmount(&self, image: &Path) -> Result<(), AssemblyError> {
        self.calls
            .lock()
            .unwrap()
            .push(DiskCall::Unmount(image.to_path_buf()));
        self.mounted.lock().unwrap().retain(|m| m != image);
        Ok(())
    }

    fn volume_path(&self, _disk: &DiskId) -> Result<PathBuf, AssemblyError> {
        Ok(self.volume.clone())
    }

    fn mount_system_partition(
        &self,
        _disk: &DiskId,
        mount_point: &Path,
    ) -> Result<(), AssemblyError> {
        self.calls
            .lock()
            .unwrap()
            .push(DiskCall::MountSystem(mount_point.to_path_buf()));
        Ok(())
    }

    fn unmount_system_partition(
        &self,
        _disk: &DiskId,
        mount_point: &Path,
    ) -> Result<(), AssemblyError> {
        self.calls
            .lock()
            .unwrap()
            .push(DiskCall::UnmountSystem(mount_point.to_path_buf()));
        Ok(())
    }
}

/// Device opener handing out handles on a shared [`MockBlockDevice`].
pub struct MockDeviceOpener {
    device: MockBlockDevice,
    opens: Mutex<Vec<DiskId>>,
}

impl MockDeviceOpener {
    pub fn new(device: MockBlockDevice) -> Self {
        Self {
            device,
            opens: Mutex::new(Vec::new()),
        }
    }

    /// The shared media, for inspection.
    pub fn device(&self) -> &MockBlockDevice {
        &self.device
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }
}

impl DeviceOpener for MockDeviceOpener {
    fn open(
        &self,
        disk: &DiskId,
        mode: AccessMode,
    ) -> Result<RawDevice<Box<dyn BlockBackend>>, DeviceError> {
        self.opens.lock().unwrap().push(disk.clone());
        RawDevice::acquire(Box::new(self.device.clone()) as Box<dyn BlockBackend>, mode)
    }
}
