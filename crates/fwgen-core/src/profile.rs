//! Device variant profiles.
//!
//! Every supported device is one row of [`PROFILES`]. Adding a device means
//! adding a row, not a type.

use std::fmt;
use std::path::Path;

/// Static description of one device variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Short codename, used in logs and CLI filters.
    pub name: &'static str,
    /// Disabled rows are kept in the table but skipped by every flow.
    pub enabled: bool,
    /// Raw bootloader payload written at offset 0 of the disk.
    pub bootloader: &'static str,
    /// UEFI payload copied into the EFI system partition.
    pub uefi: &'static str,
    /// Platform identifier passed to the packaging tool.
    pub platform_id: &'static str,
    /// Artifact file name with `{version}`, `{locale}` and `{edition}` placeholders.
    pub artifact_template: &'static str,
    /// Driver-injection command with a `{driver_pack}` placeholder.
    pub driver_template: &'static str,
    /// Extra boot-configuration store edits, applied in order.
    pub bcd_commands: &'static [&'static str],
}

impl DeviceProfile {
    /// Output file name for this variant.
    pub fn artifact_file_name(&self, version: &str, locale: &str, edition: &str) -> String {
        self.artifact_template
            .replace("{version}", version)
            .replace("{locale}", locale)
            .replace("{edition}", edition)
    }

    /// Driver definition argument for the driver-injection tool.
    pub fn driver_command(&self, driver_pack: &Path) -> String {
        let pack = driver_pack.to_string_lossy();
        self.driver_template
            .replace("{driver_pack}", pack.trim_end_matches('/'))
    }

    pub fn has_bcd_commands(&self) -> bool {
        !self.bcd_commands.is_empty()
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.platform_id)
    }
}

const LUMIA_BCD: &[&str] = &[
    "/set {default} testsigning on",
    "/set {default} nointegritychecks on",
];

/// All known variants.
pub const PROFILES: &[DeviceProfile] = &[
    DeviceProfile {
        name: "cityman",
        enabled: true,
        bootloader: "bootloaders/cityman/bootloader.bin",
        uefi: "bootloaders/cityman/UEFI.elf",
        platform_id: "Microsoft Corporation.Lumia 950 XL.P6211",
        artifact_template: "{version}_{locale}_{edition}_cityman.ffu",
        driver_template: "{driver_pack}/definitions/Desktop/ARM64/Internal/cityman.txt",
        bcd_commands: LUMIA_BCD,
    },
    DeviceProfile {
        name: "talkman",
        enabled: true,
        bootloader: "bootloaders/talkman/bootloader.bin",
        uefi: "bootloaders/talkman/UEFI.elf",
        platform_id: "Microsoft Corporation.Lumia 950.P6170",
        artifact_template: "{version}_{locale}_{edition}_talkman.ffu",
        driver_template: "{driver_pack}/definitions/Desktop/ARM64/Internal/talkman.txt",
        bcd_commands: LUMIA_BCD,
    },
    DeviceProfile {
        name: "hapanero-ab",
        enabled: true,
        bootloader: "bootloaders/hapanero/bootloader-ab.bin",
        uefi: "bootloaders/hapanero/UEFI.elf",
        platform_id: "Microsoft Corporation.Hapanero.AB",
        artifact_template: "{version}_{locale}_{edition}_hapanero-ab.ffu",
        driver_template: "{driver_pack}/definitions/Desktop/ARM64/Internal/hapanero.txt",
        bcd_commands: &[],
    },
    DeviceProfile {
        name: "hapanero-aa",
        enabled: false,
        bootloader: "bootloaders/hapanero/bootloader-aa.bin",
        uefi: "bootloaders/hapanero/UEFI.elf",
        platform_id: "Microsoft Corporation.Hapanero.AA",
        artifact_template: "{version}_{locale}_{edition}_hapanero-aa.ffu",
        driver_template: "{driver_pack}/definitions/Desktop/ARM64/Internal/hapanero.txt",
        bcd_commands: &[],
    },
];

/// Enabled variants, in table order.
pub fn enabled_profiles() -> impl Iterator<Item = &'static DeviceProfile> {
    PROFILES.iter().filter(|p| p.enabled)
}

/// Look up a variant by name, enabled or not.
pub fn find_profile(name: &str) -> Option<&'static DeviceProfile> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Shorten a four-part build version to its last two parts.
///
/// `10.0.15063.0` becomes `15063.0`; anything else is returned unchanged.
pub fn normalize_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() == 4 {
        parts[2..].join(".")
    } else {
        version.to_string()
    }
}
