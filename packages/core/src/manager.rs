//! Volume manager.
//!
//! Owns every configured volume plus the external collaborator handles,
//! and sits behind the event router as the block-subsystem handler. Events
//! are offered to volumes in configuration order; the first volume whose
//! watched subtree contains the event path consumes it. User-facing share
//! and unshare requests come in by label.

use log::{info, warn};
use snafu::{OptionExt, ensure};

use crate::config::Config;
use crate::dispatch::UeventHandler;
use crate::error::{InvalidStateSnafu, Result, UnknownVolumeSnafu};
use crate::share::{ShareCoordinator, select_share_node};
use crate::sys::Platform;
use crate::uevent::Uevent;
use crate::volume::{DirectVolume, VolumeState};

pub struct VolumeManager {
    volumes: Vec<DirectVolume>,
    platform: Platform,
    share: ShareCoordinator,
}

impl VolumeManager {
    /// Builds the manager and its volumes from a validated config.
    pub fn from_config(config: &Config, platform: Platform) -> Self {
        let volumes = config
            .volumes
            .iter()
            .map(|vc| DirectVolume::new(vc, vc.label == config.primary_label))
            .collect();
        Self {
            volumes,
            platform,
            share: ShareCoordinator::new(config.export_slots.clone()),
        }
    }

    pub fn volume(&self, label: &str) -> Option<&DirectVolume> {
        self.volumes.iter().find(|v| v.label() == label)
    }

    fn volume_mut(&mut self, label: &str) -> Result<&mut DirectVolume> {
        self.volumes
            .iter_mut()
            .find(|v| v.label() == label)
            .context(UnknownVolumeSnafu { label })
    }

    /// Exports a volume's block device to the connected host. The volume
    /// must be idle; a failed filesystem check or slot exhaustion leaves it
    /// idle and reports the failure.
    pub fn share_volume(&mut self, label: &str) -> Result<()> {
        let volume = self
            .volumes
            .iter()
            .find(|v| v.label() == label)
            .context(UnknownVolumeSnafu { label })?;
        ensure!(
            volume.state() == VolumeState::Idle,
            InvalidStateSnafu {
                label,
                state: volume.state().as_str(),
                op: "share",
            }
        );

        let node = select_share_node(volume, self.platform.checker.as_ref())?;
        let slot = self.share.export(&node)?;
        info!("sharing {} via {}", node, slot.display());

        self.volume_mut(label)?.note_shared()
    }

    /// Withdraws a volume from the host. Slot contents are left in place
    /// for a future share to overwrite.
    pub fn unshare_volume(&mut self, label: &str) -> Result<()> {
        self.volume_mut(label)?.note_unshared()
    }

    /// Records an external mount of one of the volume's devices.
    pub fn note_mounted(&mut self, label: &str, major: u32, minor: u32) -> Result<()> {
        self.volume_mut(label)?.note_mounted(major, minor)
    }

    /// Records an external unmount.
    pub fn note_unmounted(&mut self, label: &str) -> Result<()> {
        self.volume_mut(label)?.note_unmounted()
    }
}

impl UeventHandler for VolumeManager {
    fn handle_uevent(&mut self, event: &Uevent) -> Result<()> {
        for volume in &mut self.volumes {
            if volume.handle_block_event(event, &self.platform) {
                return Ok(());
            }
        }
        warn!("no volume handled block event for '{}'", event.path);
        Ok(())
    }
}
