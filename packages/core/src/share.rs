//! USB mass-storage share coordination.
//!
//! Exporting a volume to a connected host means writing one of its device
//! node paths into the backing-file attribute of a mass-storage lun. The
//! lun files are owned by the gadget driver, not by us, so every slot is
//! probed defensively: a slot already pointing into the block-device tree
//! belongs to someone, an unreadable slot is unusable, and either way the
//! coordinator moves on to the next slot in the fixed order 0, 1, 2 —
//! external consumers depend on which physical lun ends up used.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{
    ExportSlotsExhaustedSnafu, FsckFailedSnafu, IoResultExt, NoShareableDeviceSnafu, Result,
};
use crate::sys::{CheckVerdict, FsChecker, device_node_path};
use crate::volume::DirectVolume;

/// Root under which exported block-device nodes live; a slot whose backing
/// file starts with this prefix is already in use.
pub const MASS_STORAGE_ROOT: &str = "/dev/block";

/// Backing-file attributes of the mass-storage luns, in fallback order.
pub fn default_slot_paths() -> Vec<PathBuf> {
    (0..3)
        .map(|n| PathBuf::from(format!("/sys/devices/platform/usb_mass_storage/lun{}/file", n)))
        .collect()
}

/// Occupancy verdict for one export slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Occupied,
    Unavailable,
}

/// Probes and writes the ordered set of export slots.
pub struct ShareCoordinator {
    slots: Vec<PathBuf>,
}

impl ShareCoordinator {
    pub fn new(slots: Vec<PathBuf>) -> Self {
        Self { slots }
    }

    /// Reads enough of a slot's backing file to tell whether it already
    /// points at an exported device. The handle is dropped before this
    /// returns, whatever the verdict.
    fn probe_slot(path: &Path) -> SlotStatus {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return SlotStatus::Unavailable,
        };
        let mut buf = [0u8; 10];
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return SlotStatus::Unavailable,
        };
        if String::from_utf8_lossy(&buf[..n]).starts_with(MASS_STORAGE_ROOT) {
            SlotStatus::Occupied
        } else {
            SlotStatus::Free
        }
    }

    /// Writes the node path into the first free slot, returning the slot
    /// used. Occupied and unavailable slots are skipped; running out of
    /// slots is a reported failure, not a fatal one.
    pub fn export(&self, node_path: &str) -> Result<PathBuf> {
        for slot in &self.slots {
            match Self::probe_slot(slot) {
                SlotStatus::Occupied => {
                    debug!("export slot {} already in use", slot.display());
                }
                SlotStatus::Unavailable => {
                    warn!("unable to open ums lunfile {}", slot.display());
                }
                SlotStatus::Free => {
                    fs::write(slot, node_path).slot_write_context(slot.clone())?;
                    return Ok(slot.clone());
                }
            }
        }
        ExportSlotsExhaustedSnafu.fail()
    }
}

/// Picks the device node to export: the first of the volume's candidates
/// holding a clean supported filesystem. A candidate with some other
/// filesystem is skipped; a structurally broken one aborts the share with
/// the volume left untouched.
pub fn select_share_node(volume: &DirectVolume, checker: &dyn FsChecker) -> Result<String> {
    for (major, minor) in volume.device_nodes()? {
        let node = device_node_path(major, minor);
        let node = node.to_string_lossy().into_owned();
        match checker.check(Path::new(&node)) {
            CheckVerdict::Clean => return Ok(node),
            CheckVerdict::NotThisFilesystem => {
                warn!("{} does not contain a supported filesystem", node);
            }
            CheckVerdict::Failed => {
                return FsckFailedSnafu {
                    device: node,
                    message: "filesystem is structurally damaged",
                }
                .fail();
            }
        }
    }
    NoShareableDeviceSnafu {
        label: volume.label(),
    }
    .fail()
}
