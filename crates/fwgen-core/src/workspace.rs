//! Scoped resources for the pipeline.
//!
//! Each guard releases what it holds on drop, so an early return anywhere in
//! a variant's processing never leaks a temporary image, an attached disk or
//! a mounted partition. The explicit `remove`/`unmount` methods exist so the
//! happy path can surface release errors.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::AssemblyError;
use crate::tools::{DiskId, VirtualDiskService};

/// A file deleted on drop unless kept.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    /// Copy `source` to `path` and take ownership of the copy.
    pub fn copy_from(source: &Path, path: &Path) -> Result<Self, AssemblyError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| AssemblyError::io(format!("creating {}", parent.display()), e))?;
        }

        // Armed before the copy so a partial copy is cleaned up too.
        let guard = Self {
            path: path.to_path_buf(),
            armed: true,
        };
        fs::copy(source, path).map_err(|e| {
            AssemblyError::io(
                format!("copying {} to {}", source.display(), path.display()),
                e,
            )
        })?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file and return its path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Delete now, reporting failures.
    pub fn remove(mut self) -> Result<(), AssemblyError> {
        self.armed = false;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(AssemblyError::io(
                format!("deleting {}", self.path.display()),
                e,
            )),
            _ => Ok(()),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed temporary file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file"),
        }
    }
}

/// Per-variant working directory holding a copy of the input image.
///
/// The directory is removed with the image when this guard created it and
/// nothing else was put there.
#[derive(Debug)]
pub struct Workspace {
    image: Option<TempFile>,
    dir: PathBuf,
    owns_dir: bool,
}

impl Workspace {
    /// Create `dir` if needed and copy `input` into it as `name`.
    ///
    /// An existing file of the same name is overwritten.
    pub fn create(dir: &Path, name: &str, input: &Path) -> Result<Self, AssemblyError> {
        let owns_dir = !dir.exists();
        fs::create_dir_all(dir)
            .map_err(|e| AssemblyError::io(format!("creating {}", dir.display()), e))?;

        let mut workspace = Self {
            image: None,
            dir: dir.to_path_buf(),
            owns_dir,
        };
        workspace.image = Some(TempFile::copy_from(input, &dir.join(name))?);
        Ok(workspace)
    }

    pub fn image(&self) -> &Path {
        self.image.as_ref().map_or(self.dir.as_path(), TempFile::path)
    }

    pub fn remove(mut self) -> Result<(), AssemblyError> {
        if let Some(image) = self.image.take() {
            image.remove()?;
        }
        self.remove_dir();
        Ok(())
    }

    fn remove_dir(&mut self) {
        if !std::mem::take(&mut self.owns_dir) {
            return;
        }
        // Fails harmlessly when something else was put in the directory.
        if let Err(e) = fs::remove_dir(&self.dir) {
            debug!(dir = %self.dir.display(), error = %e, "Keeping work directory");
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        drop(self.image.take());
        self.remove_dir();
    }
}

/// An attached disk image, detached on drop.
pub struct MountedImage<'a> {
    disks: &'a dyn VirtualDiskService,
    image: PathBuf,
    disk: DiskId,
    mounted: bool,
}

impl<'a> MountedImage<'a> {
    pub fn mount(disks: &'a dyn VirtualDiskService, image: &Path) -> Result<Self, AssemblyError> {
        let disk = disks.mount(image)?;
        Ok(Self {
            disks,
            image: image.to_path_buf(),
            disk,
            mounted: true,
        })
    }

    pub fn disk(&self) -> &DiskId {
        &self.disk
    }

    /// Detach and attach again, picking up changes made below the
    /// filesystem. The disk identifier may change.
    pub fn remount(&mut self) -> Result<&DiskId, AssemblyError> {
        if self.mounted {
            self.disks.unmount(&self.image)?;
            self.mounted = false;
        }
        self.disk = self.disks.mount(&self.image)?;
        self.mounted = true;
        Ok(&self.disk)
    }

    pub fn unmount(mut self) -> Result<(), AssemblyError> {
        self.mounted = false;
        self.disks.unmount(&self.image)
    }
}

impl Drop for MountedImage<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.disks.unmount(&self.image) {
                warn!(image = %self.image.display(), error = %e, "Failed to detach image");
            }
        }
    }
}

/// A mounted system partition, unmounted on drop.
pub struct SystemPartition<'a> {
    disks: &'a dyn VirtualDiskService,
    disk: DiskId,
    mount_point: PathBuf,
    mounted: bool,
}

impl<'a> SystemPartition<'a> {
    pub fn mount(
        disks: &'a dyn VirtualDiskService,
        disk: &DiskId,
        mount_point: &Path,
    ) -> Result<Self, AssemblyError> {
        disks.mount_system_partition(disk, mount_point)?;
        Ok(Self {
            disks,
            disk: disk.clone(),
            mount_point: mount_point.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    pub fn unmount(mut self) -> Result<(), AssemblyError> {
        self.mounted = false;
        self.disks
            .unmount_system_partition(&self.disk, &self.mount_point)
    }
}

impl Drop for SystemPartition<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self
                .disks
                .unmount_system_partition(&self.disk, &self.mount_point)
            {
                warn!(mount_point = %self.mount_point.display(), error = %e, "Failed to unmount system partition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{DiskCall, MockDiskService};

    #[test]
    fn test_workspace_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.vhdx");
        fs::write(&input, b"image").unwrap();

        let work = dir.path().join("tmp");
        let ws = Workspace::create(&work, "temp.vhdx", &input).unwrap();
        let copy = ws.image().to_path_buf();
        assert_eq!(fs::read(&copy).unwrap(), b"image");

        drop(ws);
        assert!(!copy.exists());
        assert!(!work.exists());
        assert!(input.exists());
    }

    #[test]
    fn test_preexisting_work_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.vhdx");
        fs::write(&input, b"image").unwrap();
        let work = dir.path().join("tmp");
        fs::create_dir(&work).unwrap();

        Workspace::create(&work, "temp.vhdx", &input).unwrap().remove().unwrap();
        assert!(work.is_dir());
        assert!(!work.join("temp.vhdx").exists());
    }

    #[test]
    fn test_work_dir_with_other_files_survives() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.vhdx");
        fs::write(&input, b"image").unwrap();
        let work = dir.path().join("tmp");

        let ws = Workspace::create(&work, "temp.vhdx", &input).unwrap();
        fs::write(work.join("notes.txt"), b"keep").unwrap();
        drop(ws);

        assert!(work.join("notes.txt").exists());
        assert!(!work.join("temp.vhdx").exists());
    }

    #[test]
    fn test_failed_copy_removes_created_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("tmp");
        assert!(Workspace::create(&work, "temp.vhdx", &dir.path().join("missing")).is_err());
        assert!(!work.exists());
    }

    #[test]
    fn test_workspace_overwrites_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.vhdx");
        fs::write(&input, b"fresh").unwrap();
        fs::write(dir.path().join("temp.vhdx"), b"stale-and-longer").unwrap();

        let ws = Workspace::create(dir.path(), "temp.vhdx", &input).unwrap();
        assert_eq!(fs::read(ws.image()).unwrap(), b"fresh");
        ws.remove().unwrap();
        assert!(!dir.path().join("temp.vhdx").exists());
    }

    #[test]
    fn test_failed_copy_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.vhdx");
        let err = TempFile::copy_from(&dir.path().join("missing"), &target).unwrap_err();
        assert!(matches!(err, AssemblyError::Io { .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_kept_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("blank.vhdx");
        fs::write(&input, b"blank").unwrap();

        let out = TempFile::copy_from(&input, &dir.path().join("base.vhdx")).unwrap();
        let path = out.keep();
        assert!(path.exists());
    }

    #[test]
    fn test_mounted_image_detaches_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.vhdx");
        fs::write(&image, b"x").unwrap();
        let svc = MockDiskService::new(dir.path().join("vol"));

        {
            let mut mounted = MountedImage::mount(&svc, &image).unwrap();
            mounted.remount().unwrap();
            let _sys = SystemPartition::mount(&svc, mounted.disk(), Path::new("/sys-mnt")).unwrap();
        }

        assert!(svc.mounted().is_empty());
        assert_eq!(
            svc.calls(),
            vec![
                DiskCall::Mount(image.clone()),
                DiskCall::Unmount(image.clone()),
                DiskCall::Mount(image.clone()),
                DiskCall::MountSystem(PathBuf::from("/sys-mnt")),
                DiskCall::UnmountSystem(PathBuf::from("/sys-mnt")),
                DiskCall::Unmount(image.clone()),
            ]
        );
    }

    #[test]
    fn test_explicit_unmount_does_not_repeat_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.vhdx");
        fs::write(&image, b"x").unwrap();
        let svc = MockDiskService::new(dir.path().join("vol"));

        let mounted = MountedImage::mount(&svc, &image).unwrap();
        mounted.unmount().unwrap();

        let unmounts = svc
            .calls()
            .iter()
            .filter(|c| matches!(c, DiskCall::Unmount(_)))
            .count();
        assert_eq!(unmounts, 1);
    }
}
