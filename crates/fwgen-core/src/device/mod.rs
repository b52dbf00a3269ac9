//! Raw block device layer.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod mock;
pub mod raw;
pub mod traits;

#[cfg(target_os = "linux")]
pub use linux::LinuxBlockDevice;
pub use mock::{IoRecord, MockBlockDevice};
pub use raw::RawDevice;
pub use traits::{AccessMode, BlockBackend, DeviceError, Geometry, normalize_device_path};
