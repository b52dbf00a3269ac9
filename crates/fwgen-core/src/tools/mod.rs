//! External collaborator layer.

pub mod mock;
pub mod process;
#[cfg(target_os = "linux")]
pub mod system;
pub mod traits;

pub use mock::{DiskCall, MockDeviceOpener, MockDiskService, RecordingRunner};
pub use process::ProcessRunner;
#[cfg(target_os = "linux")]
pub use system::{NbdDiskService, SystemDeviceOpener};
pub use traits::{DeviceOpener, DiskId, ToolRunner, VirtualDiskService, path_arg, resolve_program};
