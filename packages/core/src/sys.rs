//! External collaborator seams and their native bindings.
//!
//! The lifecycle core never talks to the kernel or to external tools
//! directly; it goes through the traits below. The native implementations
//! live here, test doubles live with the tests that need them, and the
//! whole set travels as one [`Platform`] value owned by the volume manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::broadcast::{Broadcaster, LogBroadcaster};
use crate::error::{Error, IoResultExt, Result};

/// Directory under which per-device nodes are materialized.
pub const DEVICE_NODE_ROOT: &str = "/dev/block/vold";

/// Builds the node path for a (major, minor) pair, `vold/<major>:<minor>`.
pub fn device_node_path(major: u32, minor: u32) -> PathBuf {
    PathBuf::from(format!("{}/{}:{}", DEVICE_NODE_ROOT, major, minor))
}

/// Creates block device nodes.
pub trait NodeCreator {
    fn create_node(&self, path: &Path, major: u32, minor: u32) -> Result<()>;
}

/// Native node creator backed by mknod(2).
pub struct DevNodeCreator;

impl NodeCreator for DevNodeCreator {
    fn create_node(&self, path: &Path, major: u32, minor: u32) -> Result<()> {
        use nix::sys::stat::{Mode, SFlag, makedev, mknod};

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).node_context(path)?;
        }
        let dev = makedev(major as u64, minor as u64);
        match mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o600), dev) {
            Ok(()) => Ok(()),
            // A node left behind by an earlier insertion is fine.
            Err(nix::errno::Errno::EEXIST) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)).node_context(path),
        }
    }
}

/// Reads the size a device reports through sysfs.
pub trait SizeProbe {
    /// Returns the reported size, or None when the attribute is unreadable
    /// (a removed device no longer has one). Unparseable content counts as
    /// size zero, matching the phantom-device handling this feeds.
    fn device_size(&self, devpath: &str) -> Option<u64>;
}

/// Probe reading `<root>/<devpath>/size`.
pub struct SysfsSizeProbe {
    root: PathBuf,
}

impl SysfsSizeProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SizeProbe for SysfsSizeProbe {
    fn device_size(&self, devpath: &str) -> Option<u64> {
        let attr = self
            .root
            .join(devpath.trim_start_matches('/'))
            .join("size");
        let content = fs::read_to_string(&attr).ok()?;
        let size = content.trim().parse::<i64>().unwrap_or(0);
        Some(size.max(0) as u64)
    }
}

/// Outcome of a filesystem integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckVerdict {
    /// Filesystem is usable.
    Clean,
    /// The device holds some other filesystem; skip it, not an error.
    NotThisFilesystem,
    /// The filesystem is structurally broken.
    Failed,
}

/// Filesystem integrity checker.
pub trait FsChecker {
    fn check(&self, device_path: &Path) -> CheckVerdict;
}

/// Checker shelling out to fsck.fat.
pub struct FatChecker;

impl FsChecker for FatChecker {
    fn check(&self, device_path: &Path) -> CheckVerdict {
        let output = match Command::new("fsck.fat").arg("-n").arg(device_path).output() {
            Ok(output) => output,
            Err(e) => {
                debug!("unable to run fsck.fat on {}: {}", device_path.display(), e);
                return CheckVerdict::Failed;
            }
        };
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_fsck(output.status.code(), &stderr)
    }
}

/// Maps fsck.fat's exit status and stderr onto a verdict.
fn classify_fsck(code: Option<i32>, stderr: &str) -> CheckVerdict {
    match code {
        // 0 = clean, 1 = errors corrected (or correctable with -a)
        Some(0) | Some(1) => CheckVerdict::Clean,
        _ => {
            if stderr.contains("Currently, only 1 or 2 FATs are supported")
                || stderr.contains("is not a valid FAT")
                || stderr.contains("Invalid boot sector")
            {
                CheckVerdict::NotThisFilesystem
            } else {
                CheckVerdict::Failed
            }
        }
    }
}

/// Forcibly unmounts a mount point.
pub trait Unmounter {
    fn force_unmount(&self, mount_point: &Path) -> Result<()>;
}

/// Unmounter shelling out to umount(8) with force.
pub struct CommandUnmounter;

impl Unmounter for CommandUnmounter {
    fn force_unmount(&self, mount_point: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg("-f")
            .arg(mount_point)
            .output()
            .command_context("umount")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Error::Unmount {
                path: mount_point.to_path_buf(),
                message: stderr,
            });
        }
        Ok(())
    }
}

/// Cleanup hook for the primary data volume before a forced unmount.
pub trait SecondaryCleanup {
    fn cleanup(&self, label: &str) -> Result<()>;
}

/// Cleanup binding for running without a framework; nothing to tear down.
pub struct NoopCleanup;

impl SecondaryCleanup for NoopCleanup {
    fn cleanup(&self, label: &str) -> Result<()> {
        debug!("no secondary storage to clean up for '{}'", label);
        Ok(())
    }
}

/// The full set of external collaborators, owned for the daemon's lifetime
/// and threaded into every operation that needs a side effect.
pub struct Platform {
    pub nodes: Box<dyn NodeCreator>,
    pub probe: Box<dyn SizeProbe>,
    pub broadcaster: Box<dyn Broadcaster>,
    pub checker: Box<dyn FsChecker>,
    pub unmounter: Box<dyn Unmounter>,
    pub cleanup: Box<dyn SecondaryCleanup>,
}

impl Platform {
    /// Native bindings for running on a real system.
    pub fn native() -> Self {
        Self {
            nodes: Box::new(DevNodeCreator),
            probe: Box::new(SysfsSizeProbe::new("/sys")),
            broadcaster: Box::new(LogBroadcaster),
            checker: Box::new(FatChecker),
            unmounter: Box::new(CommandUnmounter),
            cleanup: Box::new(NoopCleanup),
        }
    }
}
