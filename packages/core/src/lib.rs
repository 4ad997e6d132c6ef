//! hotvol-core: Core library for removable-volume lifecycle management.
//!
//! This library rebuilds removable block-storage topology (disks and their
//! partitions) from the kernel's hotplug event stream and drives each
//! configured volume from "not present" to "ready to mount" to "mounted"
//! or "shared over USB mass-storage", tolerating devices that disappear
//! mid-operation.
//!
//! # Modules
//!
//! - [`uevent`]: Hotplug datagram parsing
//! - [`dispatch`]: Routing parsed events to registered handlers
//! - [`topology`]: Pending-partition and partition-minor bookkeeping
//! - [`volume`]: Per-volume lifecycle state machine
//! - [`share`]: USB mass-storage export coordination
//! - [`manager`]: Volume ownership and event/command fan-out
//! - [`config`]: Daemon configuration
//! - [`broadcast`]: Framework notification codes
//! - [`sys`]: External collaborator seams and native bindings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use hotvol_core::{config::Config, dispatch::EventRouter, sys::Platform};
//! use hotvol_core::{Uevent, VolumeManager};
//!
//! let config = Config::load(std::path::Path::new("/etc/hotvol.json")).unwrap();
//! let manager = VolumeManager::from_config(&config, Platform::native());
//!
//! let mut router = EventRouter::new();
//! router.register_subsystem("block", Box::new(manager));
//!
//! // One datagram received from the kernel uevent socket:
//! let buf = b"add@/devices/platform/mmc/block/mmcblk0\0ACTION=add\0\
//!             SUBSYSTEM=block\0MAJOR=179\0MINOR=0\0DEVTYPE=disk\0NPARTS=1\0";
//! let event = Uevent::parse(buf).unwrap();
//! router.dispatch(&event).unwrap();
//! ```

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod share;
pub mod sys;
pub mod topology;
pub mod uevent;
pub mod volume;

// Re-export commonly used types
pub use error::{Error, Result};
pub use manager::VolumeManager;
pub use uevent::{Action, Uevent};
pub use volume::{DirectVolume, VolumeState};
