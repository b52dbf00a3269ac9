//! Linux implementations of the mount service and device opener.
//!
//! Disk images are attached with `qemu-nbd`, which understands VHDX, and
//! their partitions are mounted with `mount(8)`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use super::traits::{DeviceOpener, DiskId, ToolRunner, VirtualDiskService, path_arg};
use crate::config::Toolchain;
use crate::device::linux::read_mounts;
use crate::device::{AccessMode, BlockBackend, DeviceError, LinuxBlockDevice, RawDevice};
use crate::error::AssemblyError;

const MOUNT: &str = "mount";
const UMOUNT: &str = "umount";

/// Mount service backed by a single NBD device.
pub struct NbdDiskService {
    runner: Arc<dyn ToolRunner>,
    qemu_nbd: PathBuf,
    disk: DiskId,
    os_partition: u32,
    esp_partition: u32,
    volume_mount: PathBuf,
    attached: Mutex<Option<PathBuf>>,
}

impl NbdDiskService {
    pub fn new(toolchain: &Toolchain, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            qemu_nbd: toolchain.qemu_nbd.clone(),
            disk: DiskId::new(toolchain.nbd_device.clone()),
            os_partition: toolchain.os_partition,
            esp_partition: toolchain.esp_partition,
            volume_mount: toolchain.volume_mount.clone(),
            attached: Mutex::new(None),
        }
    }

    fn partition_path(&self, disk: &DiskId, number: u32) -> String {
        format!("{}p{}", disk.device_path(), number)
    }

    fn mount_partition(&self, source: &str, target: &Path) -> Result<(), AssemblyError> {
        fs::create_dir_all(target)
            .map_err(|e| AssemblyError::io(format!("creating {}", target.display()), e))?;
        self.runner
            .run(Path::new(MOUNT), &[source.to_string(), path_arg(target)])
    }

    /// Unmount `target` if anything is mounted there.
    ///
    /// Raw device acquisition force-dismounts volumes behind our back, so a
    /// missing mount is not an error.
    fn unmount_if_mounted(&self, target: &Path) -> Result<(), AssemblyError> {
        let target_str = path_arg(target);
        let mounted = read_mounts()
            .map_err(|e| AssemblyError::io("reading mount table", e))?
            .iter()
            .any(|(_, t)| *t == target_str);

        if !mounted {
            debug!(target = %target_str, "Not mounted, skipping umount");
            return Ok(());
        }
        self.runner.run(Path::new(UMOUNT), &[target_str])
    }
}

impl VirtualDiskService for NbdDiskService {
    #[instrument(level = "debug", skip(self), fields(image = %image.display()))]
    fn mount(&self, image: &Path) -> Result<DiskId, AssemblyError> {
        let device = self.disk.device_path();
        self.runner.run(
            &self.qemu_nbd,
            &["--connect".to_string(), device.clone(), path_arg(image)],
        )?;
        *self.attached.lock().unwrap() = Some(image.to_path_buf());

        let os_volume = self.partition_path(&self.disk, self.os_partition);
        if let Err(e) = self.mount_partition(&os_volume, &self.volume_mount) {
            if let Err(detach) = self.unmount(image) {
                debug!(error = %detach, "Detach after failed mount also failed");
            }
            return Err(e);
        }

        info!(device = %device, volume = %self.volume_mount.display(), "Image mounted");
        Ok(self.disk.clone())
    }

    #[instrument(level = "debug", skip(self), fields(image = %image.display()))]
    fn unmount(&self, image: &Path) -> Result<(), AssemblyError> {
        let mut attached = self.attached.lock().unwrap();
        if attached.as_deref() != Some(image) {
            debug!("Image not attached, nothing to unmount");
            return Ok(());
        }

        self.unmount_if_mounted(&self.volume_mount)?;
        self.runner.run(
            &self.qemu_nbd,
            &["--disconnect".to_string(), self.disk.device_path()],
        )?;
        *attached = None;

        info!(device = %self.disk.device_path(), "Image unmounted");
        Ok(())
    }

    fn volume_path(&self, _disk: &DiskId) -> Result<PathBuf, AssemblyError> {
        Ok(self.volume_mount.clone())
    }

    fn mount_system_partition(
        &self,
        disk: &DiskId,
        mount_point: &Path,
    ) -> Result<(), AssemblyError> {
        let esp = self.partition_path(disk, self.esp_partition);
        self.mount_partition(&esp, mount_point)
    }

    fn unmount_system_partition(
        &self,
        _disk: &DiskId,
        mount_point: &Path,
    ) -> Result<(), AssemblyError> {
        self.unmount_if_mounted(mount_point)
    }

    fn prerequisites(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("NBD attach tool", self.qemu_nbd.clone()),
            ("mount tool", PathBuf::from(MOUNT)),
            ("umount tool", PathBuf::from(UMOUNT)),
        ]
    }
}

/// Opens mounted disks through [`LinuxBlockDevice`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDeviceOpener;

impl DeviceOpener for SystemDeviceOpener {
    fn open(
        &self,
        disk: &DiskId,
        mode: AccessMode,
    ) -> Result<RawDevice<Box<dyn BlockBackend>>, DeviceError> {
        let backend = LinuxBlockDevice::open(&disk.0, mode)?;
        RawDevice::acquire(Box::new(backend) as Box<dyn BlockBackend>, mode)
    }
}
