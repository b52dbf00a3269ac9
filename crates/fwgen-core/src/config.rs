//! Toolchain configuration and per-flow options.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Locations of external tools and fixed inputs.
///
/// Tools given as bare names are looked up on `PATH`; anything with a
/// directory component must exist as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// Image-composition tool (wimlib-imagex).
    pub composition_tool: PathBuf,
    /// Disk-image to FFU converter.
    pub packaging_tool: PathBuf,
    /// Driver-injection tool.
    pub driver_tool: PathBuf,
    /// Boot-configuration store editor.
    pub bcd_tool: PathBuf,
    /// Boot-manager installer used when building the base image.
    pub boot_installer: PathBuf,
    /// qemu-nbd, used to expose disk images as block devices.
    pub qemu_nbd: PathBuf,
    /// Empty disk image the base image is built from.
    pub blank_image: PathBuf,
    /// Directory holding per-variant temporary images.
    pub work_dir: PathBuf,
    /// File name of the temporary image inside `work_dir`.
    pub temp_image_name: String,
    /// NBD device the image is connected to.
    pub nbd_device: String,
    /// Partition number of the OS volume.
    pub os_partition: u32,
    /// Partition number of the EFI system partition.
    pub esp_partition: u32,
    /// Mount point of the OS volume.
    pub volume_mount: PathBuf,
    /// Mount point of the system partition.
    pub system_mount: PathBuf,
    pub locale: String,
    pub edition: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            composition_tool: PathBuf::from("wimlib-imagex"),
            packaging_tool: PathBuf::from("img2ffu"),
            driver_tool: PathBuf::from("DriverUpdater"),
            bcd_tool: PathBuf::from("bcdedit"),
            boot_installer: PathBuf::from("bcdboot"),
            qemu_nbd: PathBuf::from("qemu-nbd"),
            blank_image: PathBuf::from("blank.vhdx"),
            work_dir: PathBuf::from("tmp"),
            temp_image_name: "temp.vhdx".to_string(),
            nbd_device: "nbd0".to_string(),
            os_partition: 2,
            esp_partition: 1,
            volume_mount: PathBuf::from("/mnt/fwgen/volume"),
            system_mount: PathBuf::from("/mnt/fwgen/system"),
            locale: "en-us".to_string(),
            edition: "PROFESSIONAL".to_string(),
        }
    }
}

impl Toolchain {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Toolchain = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the per-variant temporary image.
    pub fn temp_image(&self) -> PathBuf {
        self.work_dir.join(&self.temp_image_name)
    }
}

/// Options for building the base OS image.
#[derive(Debug, Clone)]
pub struct BaseImageOptions {
    /// Where the base image is written.
    pub output: PathBuf,
    /// Root of the extracted OS distribution.
    pub source: PathBuf,
    /// Image index inside the distribution's install image.
    pub index: u32,
}

/// Options for building one artifact per variant from a prepared image.
#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub driver_pack: PathBuf,
    pub version: String,
}

/// Options for packaging straight from the mounted block device.
#[derive(Debug, Clone)]
pub struct MediaArtifactOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub version: String,
}
