//! Image assembly pipeline.
//!
//! [`Assembler`] turns a prepared disk image into one flashable artifact per
//! device variant. Each variant is processed from a fresh copy of the input:
//! the bootloader is written at the raw block level, the image is remounted,
//! and the remaining payloads are applied through external tools before the
//! packaging tool produces the artifact.
//!
//! Every temporary file, mount and device lock is held by a guard from
//! [`crate::workspace`], so a failure at any step leaves nothing behind.

pub mod bootloader;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::config::{ArtifactOptions, BaseImageOptions, MediaArtifactOptions, Toolchain};
use crate::device::AccessMode;
use crate::error::{AssemblyError, VariantFailure};
use crate::events::{AssemblyEvent, AssemblyObserver, AssemblyStep, LogLevel, TracingObserver};
use crate::profile::{DeviceProfile, enabled_profiles, normalize_version};
use crate::tools::{DeviceOpener, DiskId, ToolRunner, VirtualDiskService, path_arg, resolve_program};
use crate::workspace::{MountedImage, SystemPartition, TempFile, Workspace};

pub use bootloader::{CHUNK_SIZE, validate_payload_len, write_chunks};

/// Variant name used in events of the base-image flow.
const BASE_VARIANT: &str = "base";

/// Which entry point a prerequisite check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    BaseImage,
    Artifact,
    Media,
}

/// External collaborators driven by the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub disks: Arc<dyn VirtualDiskService>,
    pub tools: Arc<dyn ToolRunner>,
    pub devices: Arc<dyn DeviceOpener>,
}

impl Collaborators {
    /// Production collaborators: qemu-nbd mounts, child processes and
    /// Linux block devices.
    #[cfg(target_os = "linux")]
    pub fn system(toolchain: &Toolchain) -> Self {
        use crate::tools::{NbdDiskService, ProcessRunner, SystemDeviceOpener};

        let tools: Arc<dyn ToolRunner> = Arc::new(ProcessRunner);
        Self {
            disks: Arc::new(NbdDiskService::new(toolchain, tools.clone())),
            tools,
            devices: Arc::new(SystemDeviceOpener),
        }
    }
}

/// Result of a multi-variant run.
#[derive(Debug, Default, Clone)]
pub struct AssemblySummary {
    /// `(variant, artifact path)` for every variant that succeeded.
    pub artifacts: Vec<(String, PathBuf)>,
}

/// Assembly pipeline - drives the per-variant flows.
pub struct Assembler<O: AssemblyObserver> {
    toolchain: Toolchain,
    collaborators: Collaborators,
    profiles: Vec<DeviceProfile>,
    payload_root: PathBuf,
    keep_going: bool,
    observer: Arc<O>,
}

impl Assembler<TracingObserver> {
    /// Create an assembler with the default tracing observer.
    pub fn new(toolchain: Toolchain, collaborators: Collaborators) -> Self {
        Self::with_observer(toolchain, collaborators, Arc::new(TracingObserver))
    }
}

impl<O: AssemblyObserver> Assembler<O> {
    /// Create an assembler with a custom observer.
    ///
    /// Processes every enabled profile; payload paths resolve against the
    /// current directory.
    pub fn with_observer(
        toolchain: Toolchain,
        collaborators: Collaborators,
        observer: Arc<O>,
    ) -> Self {
        Self {
            toolchain,
            collaborators,
            profiles: enabled_profiles().copied().collect(),
            payload_root: PathBuf::new(),
            keep_going: false,
            observer,
        }
    }

    /// Restrict the run to `profiles`, in the given order.
    pub fn with_profiles(mut self, profiles: Vec<DeviceProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Directory that bootloader and firmware payload paths are relative to.
    pub fn with_payload_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.payload_root = root.into();
        self
    }

    /// Keep processing the remaining variants after one fails.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn profiles(&self) -> &[DeviceProfile] {
        &self.profiles
    }

    fn disks(&self) -> &dyn VirtualDiskService {
        self.collaborators.disks.as_ref()
    }

    fn payload(&self, relative: &str) -> PathBuf {
        self.payload_root.join(relative)
    }

    fn step(&self, variant: &str, step: AssemblyStep) {
        debug!(variant = %variant, ?step, "Entering step");
        self.observer.on_event(&AssemblyEvent::Step {
            variant: variant.to_string(),
            step,
        });
    }

    fn run_tool(&self, program: &Path, args: Vec<String>) -> Result<(), AssemblyError> {
        self.collaborators.tools.run(program, &args)
    }

    /// Check everything `flow` needs before any state is created.
    #[instrument(skip(self))]
    pub fn verify_prerequisites(&self, flow: Flow) -> Result<(), AssemblyError> {
        let tc = &self.toolchain;
        let mut tools: Vec<(&str, PathBuf)> = match flow {
            Flow::BaseImage => vec![
                ("image composition tool", tc.composition_tool.clone()),
                ("boot manager installer", tc.boot_installer.clone()),
            ],
            Flow::Artifact => vec![
                ("packaging tool", tc.packaging_tool.clone()),
                ("driver injection tool", tc.driver_tool.clone()),
            ],
            Flow::Media => vec![("packaging tool", tc.packaging_tool.clone())],
        };
        if flow == Flow::Artifact && self.profiles.iter().any(|p| p.has_bcd_commands()) {
            tools.push(("boot configuration editor", tc.bcd_tool.clone()));
        }
        tools.extend(self.disks().prerequisites());

        for (what, program) in tools {
            if resolve_program(&program).is_none() {
                return Err(AssemblyError::PrerequisiteMissing {
                    what: what.to_string(),
                    path: program,
                });
            }
        }

        if flow == Flow::BaseImage {
            require_file("blank image", &tc.blank_image)?;
            return Ok(());
        }

        for profile in &self.profiles {
            let bootloader = self.payload(profile.bootloader);
            let meta = require_file("bootloader payload", &bootloader)?;
            validate_payload_len(&bootloader, meta.len())?;

            if flow == Flow::Artifact {
                require_file("UEFI payload", &self.payload(profile.uefi))?;
            }
        }

        debug!(variants = self.profiles.len(), "Prerequisites present");
        Ok(())
    }

    /// Build the base OS image from a blank disk.
    ///
    /// The output is removed again if any step fails.
    #[instrument(skip(self, options), fields(output = %options.output.display()))]
    pub fn build_base_image(&self, options: &BaseImageOptions) -> Result<PathBuf, AssemblyError> {
        self.step(BASE_VARIANT, AssemblyStep::Prerequisites);
        self.verify_prerequisites(Flow::BaseImage)?;
        require_file("OS distribution image", &install_image(&options.source))?;

        self.step(BASE_VARIANT, AssemblyStep::CopyImage);
        let output = TempFile::copy_from(&self.toolchain.blank_image, &options.output)?;
        let image = MountedImage::mount(self.disks(), output.path())?;
        let volume = self.disks().volume_path(image.disk())?;

        self.step(BASE_VARIANT, AssemblyStep::ApplyImage);
        self.run_tool(
            &self.toolchain.composition_tool,
            vec![
                "apply".to_string(),
                path_arg(&install_image(&options.source)),
                options.index.to_string(),
                path_arg(&volume),
            ],
        )?;

        self.step(BASE_VARIANT, AssemblyStep::InstallBootManager);
        let system = SystemPartition::mount(self.disks(), image.disk(), &self.toolchain.system_mount)?;
        self.run_tool(
            &self.toolchain.boot_installer,
            vec![
                path_arg(&volume.join("Windows")),
                "/s".to_string(),
                path_arg(system.path()),
                "/f".to_string(),
                "UEFI".to_string(),
            ],
        )?;
        system.unmount()?;
        image.unmount()?;

        let path = output.keep();
        self.observer.on_event(&AssemblyEvent::ArtifactProduced {
            variant: BASE_VARIANT.to_string(),
            path: path.clone(),
        });
        self.observer.on_event(&AssemblyEvent::Complete);
        Ok(path)
    }

    /// Build one artifact per variant from a prepared image.
    #[instrument(skip(self, options), fields(input = %options.input.display()))]
    pub fn build_artifacts(&self, options: &ArtifactOptions) -> Result<AssemblySummary, AssemblyError> {
        self.verify_prerequisites(Flow::Artifact)?;
        require_file("input image", &options.input)?;

        let version = normalize_version(&options.version);
        self.run_variants(|profile| self.artifact_variant(profile, options, &version))
    }

    /// Build one artifact per variant, packaging straight from the block
    /// device of the mounted image.
    #[instrument(skip(self, options), fields(input = %options.input.display()))]
    pub fn build_media_artifacts(
        &self,
        options: &MediaArtifactOptions,
    ) -> Result<AssemblySummary, AssemblyError> {
        self.verify_prerequisites(Flow::Media)?;
        require_file("input image", &options.input)?;

        self.run_variants(|profile| self.media_variant(profile, options))
    }

    /// Write the variant's bootloader to the start of `disk`.
    ///
    /// The device is locked only for the duration of the transfer.
    #[instrument(skip(self, profile), fields(variant = profile.name))]
    pub fn write_bootloader(&self, disk: &DiskId, profile: &DeviceProfile) -> Result<u64, AssemblyError> {
        let path = self.payload(profile.bootloader);
        let payload = fs::read(&path)
            .map_err(|e| AssemblyError::io(format!("reading {}", path.display()), e))?;
        validate_payload_len(&path, payload.len() as u64)?;

        let mut device = self.collaborators.devices.open(disk, AccessMode::ReadWrite)?;
        let written = write_chunks(&mut device, &payload, |progress| {
            self.observer.on_event(&AssemblyEvent::Progress {
                variant: profile.name.to_string(),
                current: progress.transferred(),
                total: progress.total(),
                elapsed: progress.elapsed(),
            });
        })?;
        device.close();

        info!(disk = %disk, bytes = written, "Bootloader written");
        Ok(written)
    }

    fn run_variants<F>(&self, mut build: F) -> Result<AssemblySummary, AssemblyError>
    where
        F: FnMut(&DeviceProfile) -> Result<PathBuf, AssemblyError>,
    {
        let mut summary = AssemblySummary::default();
        let mut failures = Vec::new();

        for profile in &self.profiles {
            self.observer.on_event(&AssemblyEvent::VariantStarted {
                variant: profile.name.to_string(),
            });

            match build(profile) {
                Ok(path) => {
                    self.observer.on_event(&AssemblyEvent::ArtifactProduced {
                        variant: profile.name.to_string(),
                        path: path.clone(),
                    });
                    summary.artifacts.push((profile.name.to_string(), path));
                }
                Err(e) => {
                    self.observer.on_event(&AssemblyEvent::VariantFailed {
                        variant: profile.name.to_string(),
                        message: e.to_string(),
                    });
                    if !self.keep_going {
                        return Err(e);
                    }
                    self.observer.on_event(&AssemblyEvent::Log {
                        level: LogLevel::Warn,
                        message: format!("{} failed, continuing with remaining variants", profile.name),
                    });
                    failures.push(VariantFailure {
                        variant: profile.name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.observer.on_event(&AssemblyEvent::Complete);
        if !failures.is_empty() {
            return Err(AssemblyError::VariantsFailed { failures });
        }
        Ok(summary)
    }

    /// Copy the input, write the bootloader and remount for filesystem
    /// access.
    fn prepare_image<'a>(
        &'a self,
        profile: &DeviceProfile,
        workspace: &Workspace,
    ) -> Result<MountedImage<'a>, AssemblyError> {
        let mut image = MountedImage::mount(self.disks(), workspace.image())?;

        self.step(profile.name, AssemblyStep::WriteBootloader);
        self.write_bootloader(image.disk(), profile)?;

        self.step(profile.name, AssemblyStep::Remount);
        image.remount()?;
        Ok(image)
    }

    fn create_workspace(&self, profile: &DeviceProfile, input: &Path) -> Result<Workspace, AssemblyError> {
        self.step(profile.name, AssemblyStep::CopyImage);
        Workspace::create(
            &self.toolchain.work_dir,
            &self.toolchain.temp_image_name,
            input,
        )
    }

    fn artifact_variant(
        &self,
        profile: &DeviceProfile,
        options: &ArtifactOptions,
        version: &str,
    ) -> Result<PathBuf, AssemblyError> {
        let workspace = self.create_workspace(profile, &options.input)?;
        let image = self.prepare_image(profile, &workspace)?;
        let volume = self.disks().volume_path(image.disk())?;

        self.step(profile.name, AssemblyStep::WriteFirmware);
        copy_firmware(&self.payload(profile.uefi), &volume)?;

        if profile.has_bcd_commands() {
            self.step(profile.name, AssemblyStep::ConfigureBoot);
            let system = SystemPartition::mount(self.disks(), image.disk(), &self.toolchain.system_mount)?;
            let store = system.path().join("EFI").join("Microsoft").join("Boot").join("BCD");
            for command in profile.bcd_commands {
                let mut args = vec!["/store".to_string(), path_arg(&store)];
                args.extend(command.split_whitespace().map(str::to_string));
                self.run_tool(&self.toolchain.bcd_tool, args)?;
            }
            system.unmount()?;
        }

        self.step(profile.name, AssemblyStep::InjectDrivers);
        self.run_tool(
            &self.toolchain.driver_tool,
            vec![
                profile.driver_command(&options.driver_pack),
                path_arg(&options.driver_pack),
                path_arg(&volume),
            ],
        )?;
        image.unmount()?;

        self.step(profile.name, AssemblyStep::Package);
        let output = self.artifact_path(profile, &options.output_dir, version)?;
        self.run_tool(
            &self.toolchain.packaging_tool,
            package_args(path_arg(workspace.image()), &output, profile, &options.version),
        )?;

        self.step(profile.name, AssemblyStep::Cleanup);
        workspace.remove()?;
        Ok(output)
    }

    fn media_variant(
        &self,
        profile: &DeviceProfile,
        options: &MediaArtifactOptions,
    ) -> Result<PathBuf, AssemblyError> {
        let workspace = self.create_workspace(profile, &options.input)?;
        let image = self.prepare_image(profile, &workspace)?;

        self.step(profile.name, AssemblyStep::Package);
        let output = self.artifact_path(profile, &options.output_dir, &options.version)?;
        self.run_tool(
            &self.toolchain.packaging_tool,
            package_args(image.disk().device_path(), &output, profile, &options.version),
        )?;
        image.unmount()?;

        self.step(profile.name, AssemblyStep::Cleanup);
        workspace.remove()?;
        Ok(output)
    }

    fn artifact_path(
        &self,
        profile: &DeviceProfile,
        output_dir: &Path,
        version: &str,
    ) -> Result<PathBuf, AssemblyError> {
        fs::create_dir_all(output_dir)
            .map_err(|e| AssemblyError::io(format!("creating {}", output_dir.display()), e))?;
        let name = profile.artifact_file_name(version, &self.toolchain.locale, &self.toolchain.edition);
        Ok(output_dir.join(name))
    }
}

fn require_file(what: &str, path: &Path) -> Result<fs::Metadata, AssemblyError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta),
        _ => Err(AssemblyError::PrerequisiteMissing {
            what: what.to_string(),
            path: path.to_path_buf(),
        }),
    }
}

fn install_image(source: &Path) -> PathBuf {
    source.join("sources").join("install.wim")
}

fn copy_firmware(uefi: &Path, volume: &Path) -> Result<(), AssemblyError> {
    let esp = volume.join("EFIESP");
    fs::create_dir_all(&esp)
        .map_err(|e| AssemblyError::io(format!("creating {}", esp.display()), e))?;
    let target = esp.join("UEFI.elf");
    fs::copy(uefi, &target).map_err(|e| {
        AssemblyError::io(
            format!("copying {} to {}", uefi.display(), target.display()),
            e,
        )
    })?;
    Ok(())
}

fn package_args(source: String, output: &Path, profile: &DeviceProfile, version: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        source,
        "-f".to_string(),
        path_arg(output),
        "-p".to_string(),
        profile.platform_id.to_string(),
        "-o".to_string(),
        version.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, MockBlockDevice};
    use crate::events::{NullObserver, RecordingObserver};
    use crate::profile::find_profile;
    use crate::tools::{DiskCall, MockDeviceOpener, MockDiskService, RecordingRunner};
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        dir: TempDir,
        toolchain: Toolchain,
        runner: Arc<RecordingRunner>,
        disks: Arc<MockDiskService>,
        devices: Arc<MockDeviceOpener>,
        observer: Arc<RecordingObserver>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();

            let bin = root.join("bin");
            fs::create_dir_all(&bin).unwrap();
            for tool in ["wimlib-imagex", "img2ffu", "DriverUpdater", "bcdedit", "bcdboot"] {
                fs::write(bin.join(tool), b"").unwrap();
            }

            let toolchain = Toolchain {
                composition_tool: bin.join("wimlib-imagex"),
                packaging_tool: bin.join("img2ffu"),
                driver_tool: bin.join("DriverUpdater"),
                bcd_tool: bin.join("bcdedit"),
                boot_installer: bin.join("bcdboot"),
                blank_image: root.join("blank.vhdx"),
                work_dir: root.join("tmp"),
                system_mount: root.join("system"),
                ..Default::default()
            };
            fs::write(&toolchain.blank_image, b"blank disk").unwrap();
            fs::write(root.join("input.vhdx"), b"prepared disk").unwrap();

            for profile in crate::profile::PROFILES {
                write_payload(root, profile.bootloader, &patterned(CHUNK_SIZE * 2));
                write_payload(root, profile.uefi, b"uefi image");
            }

            Self {
                toolchain,
                runner: Arc::new(RecordingRunner::new()),
                disks: Arc::new(MockDiskService::new(root.join("volume"))),
                devices: Arc::new(MockDeviceOpener::new(MockBlockDevice::new(16 * MIB, 512))),
                observer: Arc::new(RecordingObserver::new()),
                dir,
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn assembler(&self, names: &[&str]) -> Assembler<RecordingObserver> {
            self.assembler_with(names, self.observer.clone())
        }

        fn assembler_with<O: AssemblyObserver>(&self, names: &[&str], observer: Arc<O>) -> Assembler<O> {
            let collaborators = Collaborators {
                disks: self.disks.clone(),
                tools: self.runner.clone(),
                devices: self.devices.clone(),
            };
            let profiles = names.iter().map(|n| *find_profile(n).unwrap()).collect();
            Assembler::with_observer(self.toolchain.clone(), collaborators, observer)
                .with_profiles(profiles)
                .with_payload_root(self.root())
        }

        fn artifact_options(&self) -> ArtifactOptions {
            ArtifactOptions {
                input: self.root().join("input.vhdx"),
                output_dir: self.root().join("out"),
                driver_pack: self.root().join("drivers"),
                version: "10.0.15063.0".to_string(),
            }
        }

        fn media_options(&self) -> MediaArtifactOptions {
            MediaArtifactOptions {
                input: self.root().join("input.vhdx"),
                output_dir: self.root().join("out"),
                version: "10.0.15063.0".to_string(),
            }
        }

        fn temp_image(&self) -> PathBuf {
            self.toolchain.temp_image()
        }

        fn assert_released(&self) {
            assert!(self.disks.mounted().is_empty(), "image left attached");
            assert!(!self.temp_image().exists(), "temporary image left behind");
            assert!(!self.toolchain.work_dir.exists(), "work directory left behind");
            let device = self.devices.device();
            assert!(!device.is_locked(), "device lock leaked");
            assert_eq!(device.lock_count(), device.unlock_count());
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ 0x5A).collect()
    }

    fn write_payload(root: &Path, relative: &str, data: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_ten_mib_bootloader_written_in_80_chunks() {
        let fx = Fixture::new();
        let payload = patterned(10 * MIB);
        write_payload(fx.root(), find_profile("cityman").unwrap().bootloader, &payload);

        fx.assembler(&["cityman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap();

        let device = fx.devices.device();
        let writes = device.writes();
        assert_eq!(writes.len(), 80);
        assert!(writes.iter().all(|w| w.len == CHUNK_SIZE));
        assert_eq!(writes[0].offset, 0);
        assert_eq!(writes[79].offset, (79 * CHUNK_SIZE) as u64);

        let data = device.data();
        assert_eq!(data[0], payload[0]);
        assert_eq!(&data[..payload.len()], &payload[..]);
        assert_eq!(fx.observer.progress_count(), 80);
    }

    #[test]
    fn test_artifact_flow_steps_and_arguments() {
        let fx = Fixture::new();
        let options = fx.artifact_options();
        let summary = fx.assembler(&["cityman"]).build_artifacts(&options).unwrap();

        let expected = fx.root().join("out").join("15063.0_en-us_PROFESSIONAL_cityman.ffu");
        assert_eq!(summary.artifacts, vec![("cityman".to_string(), expected.clone())]);

        assert_eq!(
            fx.observer.steps("cityman"),
            vec![
                AssemblyStep::CopyImage,
                AssemblyStep::WriteBootloader,
                AssemblyStep::Remount,
                AssemblyStep::WriteFirmware,
                AssemblyStep::ConfigureBoot,
                AssemblyStep::InjectDrivers,
                AssemblyStep::Package,
                AssemblyStep::Cleanup,
            ]
        );

        let firmware = fx.root().join("volume").join("EFIESP").join("UEFI.elf");
        assert_eq!(fs::read(firmware).unwrap(), b"uefi image");

        let store = path_arg(&fx.toolchain.system_mount.join("EFI/Microsoft/Boot/BCD"));
        assert_eq!(
            fx.runner.calls_to(&fx.toolchain.bcd_tool),
            vec![
                vec!["/store".to_string(), store.clone(), "/set".into(), "{default}".into(), "testsigning".into(), "on".into()],
                vec!["/store".to_string(), store, "/set".into(), "{default}".into(), "nointegritychecks".into(), "on".into()],
            ]
        );

        assert_eq!(
            fx.runner.calls_to(&fx.toolchain.driver_tool),
            vec![vec![
                path_arg(&options.driver_pack.join("definitions/Desktop/ARM64/Internal/cityman.txt")),
                path_arg(&options.driver_pack),
                path_arg(&fx.root().join("volume")),
            ]]
        );

        assert_eq!(
            fx.runner.calls_to(&fx.toolchain.packaging_tool),
            vec![vec![
                "-i".to_string(),
                path_arg(&fx.temp_image()),
                "-f".to_string(),
                path_arg(&expected),
                "-p".to_string(),
                "Microsoft Corporation.Lumia 950 XL.P6211".to_string(),
                "-o".to_string(),
                "10.0.15063.0".to_string(),
            ]]
        );

        let image = fx.temp_image();
        assert_eq!(
            fx.disks.calls(),
            vec![
                DiskCall::Mount(image.clone()),
                DiskCall::Unmount(image.clone()),
                DiskCall::Mount(image.clone()),
                DiskCall::MountSystem(fx.toolchain.system_mount.clone()),
                DiskCall::UnmountSystem(fx.toolchain.system_mount.clone()),
                DiskCall::Unmount(image),
            ]
        );
        fx.assert_released();
    }

    #[test]
    fn test_empty_bcd_list_skips_boot_configuration() {
        let fx = Fixture::new();
        fx.assembler(&["hapanero-ab"])
            .build_artifacts(&fx.artifact_options())
            .unwrap();

        assert!(fx.runner.calls_to(&fx.toolchain.bcd_tool).is_empty());
        assert!(!fx.observer.steps("hapanero-ab").contains(&AssemblyStep::ConfigureBoot));
        assert!(
            !fx.disks
                .calls()
                .iter()
                .any(|c| matches!(c, DiskCall::MountSystem(_)))
        );
    }

    #[test]
    fn test_missing_payload_touches_nothing() {
        let fx = Fixture::new();
        fs::remove_file(fx.root().join(find_profile("talkman").unwrap().bootloader)).unwrap();

        let err = fx
            .assembler(&["cityman", "talkman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(err, AssemblyError::PrerequisiteMissing { .. }));
        assert_eq!(fx.devices.open_count(), 0);
        assert!(!fx.toolchain.work_dir.exists());
        assert!(fx.disks.calls().is_empty());
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn test_missing_tool_is_prerequisite_failure() {
        let fx = Fixture::new();
        fs::remove_file(&fx.toolchain.driver_tool).unwrap();

        let err = fx
            .assembler(&["hapanero-ab"])
            .verify_prerequisites(Flow::Artifact)
            .unwrap_err();
        match err {
            AssemblyError::PrerequisiteMissing { what, path } => {
                assert_eq!(what, "driver injection tool");
                assert_eq!(path, fx.toolchain.driver_tool);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The media flow does not use the driver tool.
        fx.assembler(&["hapanero-ab"])
            .verify_prerequisites(Flow::Media)
            .unwrap();
    }

    #[test]
    fn test_partial_chunk_payload_rejected_up_front() {
        let fx = Fixture::new();
        write_payload(
            fx.root(),
            find_profile("cityman").unwrap().bootloader,
            &patterned(CHUNK_SIZE + 1),
        );

        let err = fx
            .assembler(&["cityman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(err, AssemblyError::InvalidPayload { .. }));
        assert_eq!(fx.devices.open_count(), 0);
        assert!(!fx.toolchain.work_dir.exists());
    }

    #[test]
    fn test_tool_failure_releases_everything() {
        let fx = Fixture::new();
        fx.runner.fail_on(fx.toolchain.driver_tool.clone());

        let err = fx
            .assembler(&["cityman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(err, AssemblyError::ExternalToolFailure { .. }));
        assert!(fx.runner.calls_to(&fx.toolchain.packaging_tool).is_empty());
        fx.assert_released();
    }

    #[test]
    fn test_lock_failure_releases_workspace_and_mount() {
        let fx = Fixture::new();
        fx.devices.device().fail_lock(true);

        let err = fx
            .assembler(&["cityman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(
            err,
            AssemblyError::Device(DeviceError::DeviceLockFailed { .. })
        ));
        assert!(fx.devices.device().writes().is_empty());
        assert!(fx.disks.mounted().is_empty());
        assert!(!fx.temp_image().exists());
    }

    #[test]
    fn test_first_failure_aborts_run_by_default() {
        let fx = Fixture::new();
        fx.runner.fail_on(fx.toolchain.packaging_tool.clone());

        let err = fx
            .assembler(&["cityman", "talkman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(err, AssemblyError::ExternalToolFailure { .. }));
        assert_eq!(fx.runner.calls_to(&fx.toolchain.packaging_tool).len(), 1);
        assert!(fx.observer.steps("talkman").is_empty());
        fx.assert_released();
    }

    #[test]
    fn test_keep_going_reports_every_failure() {
        let fx = Fixture::new();
        fx.runner.fail_on(fx.toolchain.packaging_tool.clone());

        let err = fx
            .assembler(&["cityman", "talkman", "hapanero-ab"])
            .keep_going(true)
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        match err {
            AssemblyError::VariantsFailed { failures } => {
                let names: Vec<_> = failures.iter().map(|f| f.variant.as_str()).collect();
                assert_eq!(names, ["cityman", "talkman", "hapanero-ab"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.runner.calls_to(&fx.toolchain.packaging_tool).len(), 3);
        let events = fx.observer.events();
        let warnings = events
            .iter()
            .filter(|e| matches!(e, AssemblyEvent::Log { level: LogLevel::Warn, .. }))
            .count();
        assert_eq!(warnings, 3);
        assert!(events.iter().any(|e| matches!(e, AssemblyEvent::Complete)));
        fx.assert_released();
    }

    #[test]
    fn test_failed_remount_releases_workspace() {
        let fx = Fixture::new();
        fx.disks.fail_mounts_after(1);

        let err = fx
            .assembler(&["cityman"])
            .build_artifacts(&fx.artifact_options())
            .unwrap_err();

        assert!(matches!(err, AssemblyError::ExternalToolFailure { .. }));
        assert_eq!(fx.disks.mount_count(), 2);
        assert_eq!(fx.devices.device().writes().len(), 2);
        assert!(fx.runner.calls().is_empty());
        fx.assert_released();
    }

    #[test]
    fn test_silent_observer_runs_media_flow() {
        let fx = Fixture::new();
        let summary = fx
            .assembler_with(&["talkman"], Arc::new(NullObserver))
            .build_media_artifacts(&fx.media_options())
            .unwrap();

        assert_eq!(summary.artifacts.len(), 1);
        assert!(fx.observer.events().is_empty());
        fx.assert_released();
    }

    #[test]
    fn test_media_flow_packages_from_device() {
        let fx = Fixture::new();
        let summary = fx
            .assembler(&["talkman"])
            .build_media_artifacts(&fx.media_options())
            .unwrap();

        let expected = fx.root().join("out").join("10.0.15063.0_en-us_PROFESSIONAL_talkman.ffu");
        assert_eq!(summary.artifacts, vec![("talkman".to_string(), expected.clone())]);
        assert_eq!(
            fx.runner.calls(),
            vec![(
                fx.toolchain.packaging_tool.clone(),
                vec![
                    "-i".to_string(),
                    "/dev/mock0".to_string(),
                    "-f".to_string(),
                    path_arg(&expected),
                    "-p".to_string(),
                    "Microsoft Corporation.Lumia 950.P6170".to_string(),
                    "-o".to_string(),
                    "10.0.15063.0".to_string(),
                ],
            )]
        );
        assert_eq!(fx.devices.device().writes().len(), 2);
        fx.assert_released();
    }

    #[test]
    fn test_base_image_flow() {
        let fx = Fixture::new();
        let source = fx.root().join("dvd");
        write_payload(&source, "sources/install.wim", b"wim");
        let options = BaseImageOptions {
            output: fx.root().join("base.vhdx"),
            source: source.clone(),
            index: 3,
        };

        let output = fx.assembler(&[]).build_base_image(&options).unwrap();

        assert_eq!(output, options.output);
        assert_eq!(fs::read(&output).unwrap(), b"blank disk");
        let volume = fx.root().join("volume");
        assert_eq!(
            fx.runner.calls_to(&fx.toolchain.composition_tool),
            vec![vec![
                "apply".to_string(),
                path_arg(&source.join("sources/install.wim")),
                "3".to_string(),
                path_arg(&volume),
            ]]
        );
        assert_eq!(
            fx.runner.calls_to(&fx.toolchain.boot_installer),
            vec![vec![
                path_arg(&volume.join("Windows")),
                "/s".to_string(),
                path_arg(&fx.toolchain.system_mount),
                "/f".to_string(),
                "UEFI".to_string(),
            ]]
        );
        assert!(fx.disks.mounted().is_empty());
        assert_eq!(fx.devices.open_count(), 0);
    }

    #[test]
    fn test_base_image_failure_removes_output() {
        let fx = Fixture::new();
        let source = fx.root().join("dvd");
        write_payload(&source, "sources/install.wim", b"wim");
        fx.runner.fail_on(fx.toolchain.composition_tool.clone());

        let options = BaseImageOptions {
            output: fx.root().join("base.vhdx"),
            source,
            index: 1,
        };
        let err = fx.assembler(&[]).build_base_image(&options).unwrap_err();

        assert!(matches!(err, AssemblyError::ExternalToolFailure { .. }));
        assert!(!options.output.exists());
        assert!(fx.disks.mounted().is_empty());
    }
}
