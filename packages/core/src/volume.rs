//! Per-volume lifecycle state machine.
//!
//! A [`DirectVolume`] owns one physical slot: it claims a set of device-path
//! prefixes, rebuilds the disk/partition topology from the block uevents
//! that land in that subtree, and walks the volume through NoMedia →
//! Pending → Idle → Mounted/Shared. Partitions may be announced before,
//! after, or interleaved with their parent disk, and the disk may vanish
//! mid-use; both are normal inputs here, not failures.

use log::{debug, error, info, warn};
use snafu::{OptionExt, ensure};

use crate::broadcast::EventCode;
use crate::config::VolumeConfig;
use crate::error::{InvalidStateSnafu, NoShareableDeviceSnafu, Result};
use crate::sys::{Platform, device_node_path};
use crate::topology::{MAX_PARTITIONS, PartitionTable, PendingPartitions};
use crate::uevent::{Action, Uevent};
use std::path::{Path, PathBuf};

/// Lifecycle states of a volume. The machine cycles for the daemon's life;
/// there is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    NoMedia,
    /// Disk announced, partitions still expected.
    Pending,
    Checking,
    Formatting,
    /// Media present and ready to mount or share.
    Idle,
    Mounted,
    Shared,
    /// The mounted partition vanished; an emergency unmount is in flight.
    BadRemoval,
}

impl VolumeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoMedia => "no-media",
            Self::Pending => "pending",
            Self::Checking => "checking",
            Self::Formatting => "formatting",
            Self::Idle => "idle",
            Self::Mounted => "mounted",
            Self::Shared => "shared",
            Self::BadRemoval => "bad-removal",
        }
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disk-attached volume and its topology bookkeeping.
pub struct DirectVolume {
    label: String,
    mount_point: PathBuf,
    watched_paths: Vec<String>,
    /// Fixed partition number, or None when this instance owns the whole
    /// disk.
    part_idx: Option<u32>,
    /// Whether this volume's label marks it as the primary data volume
    /// (which gets secondary-storage cleanup before a forced unmount).
    is_primary: bool,

    state: VolumeState,
    disk_major: Option<u32>,
    disk_minor: Option<u32>,
    num_parts: u32,
    partitions: PartitionTable,
    pending: PendingPartitions,
    insert_broadcast_sent: bool,
    mounted_device: Option<(u32, u32)>,
}

impl DirectVolume {
    /// Creates the volume for one configured slot. Called once at startup;
    /// the instance lives for the daemon's lifetime.
    pub fn new(config: &VolumeConfig, is_primary: bool) -> Self {
        Self {
            label: config.label.clone(),
            mount_point: config.mount_point.clone(),
            watched_paths: config.watched_paths.clone(),
            part_idx: config.partition,
            is_primary,
            state: VolumeState::NoMedia,
            disk_major: None,
            disk_minor: None,
            num_parts: 0,
            partitions: PartitionTable::new(),
            pending: PendingPartitions::new(),
            insert_broadcast_sent: false,
            mounted_device: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn state(&self) -> VolumeState {
        self.state
    }

    /// Expected partition count as currently reported by the kernel.
    pub fn expected_partitions(&self) -> u32 {
        self.num_parts
    }

    /// Minor recorded for a partition number, if it has been announced.
    pub fn partition_minor(&self, part_num: u32) -> Option<u32> {
        self.partitions.minor(part_num)
    }

    /// Whether the event path falls under one of this volume's claimed
    /// device subtrees.
    pub fn watches(&self, devpath: &str) -> bool {
        self.watched_paths.iter().any(|p| devpath.starts_with(p.as_str()))
    }

    /// Feeds one block uevent through the state machine. Returns false when
    /// the event is outside this volume's watched subtrees; everything else
    /// is consumed here, with failures logged rather than propagated (a bad
    /// event must never take the daemon down).
    pub fn handle_block_event(&mut self, event: &Uevent, platform: &Platform) -> bool {
        if !self.watches(&event.path) {
            return false;
        }

        // A readable size attribute reporting nothing usable means the
        // kernel announced a phantom device; drop the event wholesale. An
        // unreadable attribute (normal once the device is gone) lets the
        // event through.
        if let Some(size) = platform.probe.device_size(&event.path) {
            if size == 0 {
                debug!(
                    "Volume {}: dropping event for zero-size device at {}",
                    self.label, event.path
                );
                return true;
            }
        }

        let Some((major, minor)) = read_major_minor(event) else {
            error!(
                "Volume {}: block event for {} lacks usable MAJOR/MINOR",
                self.label, event.path
            );
            return true;
        };

        let is_disk = match event.find_param("DEVTYPE") {
            Some(devtype) => devtype == "disk",
            None => {
                warn!(
                    "block event for {} missing DEVTYPE, assuming partition",
                    event.path
                );
                false
            }
        };

        match event.action {
            Action::Add => {
                let node = device_node_path(major, minor);
                if let Err(e) = platform.nodes.create_node(&node, major, minor) {
                    error!("error making device node '{}': {}", node.display(), e);
                }
                if is_disk {
                    self.disk_added(major, minor, event, platform);
                } else if let Err(e) = self.partition_added(major, minor, event, platform) {
                    error!("Volume {}: partition add rejected: {}", self.label, e);
                }
            }
            Action::Remove => {
                if is_disk {
                    self.disk_removed(major, minor, platform);
                } else {
                    self.partition_removed(major, minor, platform);
                }
            }
            Action::Change => {
                if is_disk {
                    self.disk_changed(major, minor, event);
                } else {
                    self.partition_changed(major, minor);
                }
            }
        }
        true
    }

    fn disk_added(&mut self, major: u32, minor: u32, event: &Uevent, platform: &Platform) {
        if let Some(tracked) = self.disk_major {
            if tracked != major {
                error!(
                    "Volume {}: disk add with major {} conflicts with tracked disk major {}",
                    self.label, major, tracked
                );
                return;
            }
        }
        self.disk_major = Some(major);
        self.disk_minor = Some(minor);

        match event.find_param("NPARTS") {
            Some(value) => {
                let nparts = clamp_part_count(&self.label, value.parse().unwrap_or(0));
                self.num_parts = nparts;
                self.pending.reset(nparts);
                if nparts == 0 {
                    self.set_state(VolumeState::Idle);
                } else {
                    self.set_state(VolumeState::Pending);
                }
                // Announce the insertion from the partition event instead,
                // so the framework never sees a disk whose partition
                // major/minor numbers are not usable yet.
                if !self.insert_broadcast_sent {
                    debug!(
                        "Volume {}: waiting for partition events before insertion broadcast",
                        self.label
                    );
                }
            }
            None => {
                warn!("kernel block uevent missing 'NPARTS'");
                // The disk node itself stands in for the single expected
                // partition-shaped device.
                self.num_parts = 1;
                self.pending.reset(0);
                self.set_state(VolumeState::Idle);
                self.broadcast_inserted(platform);
            }
        }
    }

    fn partition_added(
        &mut self,
        major: u32,
        minor: u32,
        event: &Uevent,
        platform: &Platform,
    ) -> Result<()> {
        let part_num = match event.find_param("PARTN") {
            Some(value) => value.parse().unwrap_or(0),
            None => {
                warn!("kernel block uevent missing 'PARTN'");
                1
            }
        };

        match self.disk_major {
            None => {
                debug!(
                    "Volume {}: partition {}:{} announced before its disk",
                    self.label, major, minor
                );
                self.disk_major = Some(major);
            }
            Some(tracked) if tracked != major => {
                error!(
                    "partition '{}' has a different major than its disk",
                    event.path
                );
                return Ok(());
            }
            Some(_) => {}
        }

        self.partitions.record(part_num, minor)?;
        if part_num > self.num_parts {
            self.num_parts = part_num;
        }
        self.pending.mark_seen();
        self.broadcast_inserted(platform);

        if self.pending.is_complete()
            && self.state != VolumeState::Formatting
            && self.state != VolumeState::Checking
        {
            self.set_state(VolumeState::Idle);
        }
        Ok(())
    }

    fn disk_changed(&mut self, major: u32, minor: u32, event: &Uevent) {
        if self.disk_major != Some(major) || self.disk_minor != Some(minor) {
            debug!(
                "Volume {}: ignoring change for untracked disk {}:{}",
                self.label, major, minor
            );
            return;
        }

        info!("Volume {} disk has changed", self.label);
        let nparts = match event.find_param("NPARTS") {
            Some(value) => clamp_part_count(&self.label, value.parse().unwrap_or(0)),
            None => {
                warn!("kernel block uevent missing 'NPARTS'");
                1
            }
        };

        // A topology change invalidates the partition bookkeeping built
        // from the previous announcement.
        self.num_parts = nparts;
        self.pending.reset(nparts);
        self.partitions.clear();

        if self.state != VolumeState::Formatting {
            if nparts == 0 {
                self.set_state(VolumeState::Idle);
            } else {
                self.set_state(VolumeState::Pending);
            }
        }
    }

    fn partition_changed(&self, major: u32, minor: u32) {
        debug!(
            "Volume {} {} partition {}:{} changed",
            self.label,
            self.mount_point.display(),
            major,
            minor
        );
    }

    fn disk_removed(&mut self, major: u32, minor: u32, platform: &Platform) {
        if self.disk_major != Some(major) || self.disk_minor != Some(minor) {
            debug!(
                "Volume {}: ignoring remove for untracked disk {}:{}",
                self.label, major, minor
            );
            return;
        }
        if self.state == VolumeState::NoMedia {
            debug!("Volume {}: duplicate disk remove, already no media", self.label);
            return;
        }

        debug!(
            "Volume {} {} disk {}:{} removed",
            self.label,
            self.mount_point.display(),
            major,
            minor
        );
        let msg = format!(
            "Volume {} {} disk removed ({}:{})",
            self.label,
            self.mount_point.display(),
            major,
            minor
        );
        platform
            .broadcaster
            .send_broadcast(EventCode::DiskRemoved, &msg, false);

        // End of the insertion episode: forget the topology entirely so the
        // next insertion starts clean.
        self.insert_broadcast_sent = false;
        self.disk_major = None;
        self.disk_minor = None;
        self.num_parts = 0;
        self.pending = PendingPartitions::new();
        self.partitions.clear();
        self.mounted_device = None;
        self.set_state(VolumeState::NoMedia);
    }

    fn partition_removed(&mut self, major: u32, minor: u32, platform: &Platform) {
        debug!(
            "Volume {} {} partition {}:{} removed",
            self.label,
            self.mount_point.display(),
            major,
            minor
        );

        // The framework doesn't need partition-level removal notices unless
        // the partition is mounted; the disk remove covers everything else.
        if self.state != VolumeState::Mounted {
            return;
        }
        if self.mounted_device != Some((major, minor)) {
            return;
        }

        let msg = format!(
            "Volume {} {} bad removal ({}:{})",
            self.label,
            self.mount_point.display(),
            major,
            minor
        );
        platform
            .broadcaster
            .send_broadcast(EventCode::BadRemoval, &msg, false);
        self.set_state(VolumeState::BadRemoval);

        if self.is_primary {
            if let Err(e) = platform.cleanup.cleanup(&self.label) {
                error!(
                    "failed to clean up secondary storage - unmount will probably fail: {}",
                    e
                );
            }
        }

        match platform.unmounter.force_unmount(&self.mount_point) {
            Ok(()) => {
                info!("Volume {}: recovered from bad removal", self.label);
                self.mounted_device = None;
                self.set_state(VolumeState::Idle);
            }
            Err(e) => {
                // Unrecoverable for this mount; the daemon keeps serving
                // the other volumes.
                error!("failed to unmount volume on bad removal: {}", e);
            }
        }
    }

    fn broadcast_inserted(&mut self, platform: &Platform) {
        if self.insert_broadcast_sent {
            return;
        }
        let msg = format!(
            "Volume {} {} disk inserted ({}:{})",
            self.label,
            self.mount_point.display(),
            self.disk_major.unwrap_or(0),
            self.disk_minor.unwrap_or(0)
        );
        platform
            .broadcaster
            .send_broadcast(EventCode::DiskInserted, &msg, false);
        self.insert_broadcast_sent = true;
    }

    /// Candidate (major, minor) device nodes for mounting or sharing, in
    /// partition order. Falls back to the bare disk when the disk exposes
    /// no partition-shaped nodes.
    pub fn device_nodes(&self) -> Result<Vec<(u32, u32)>> {
        let major = self.disk_major.context(NoShareableDeviceSnafu {
            label: self.label.as_str(),
        })?;

        if let Some(idx) = self.part_idx {
            let minor = self.partitions.minor(idx).context(NoShareableDeviceSnafu {
                label: self.label.as_str(),
            })?;
            return Ok(vec![(major, minor)]);
        }

        let mut nodes = Vec::new();
        for part_num in 1..=self.num_parts {
            match self.partitions.minor(part_num) {
                Some(minor) => nodes.push((major, minor)),
                None => warn!(
                    "Volume {}: partition {} never announced, skipping",
                    self.label, part_num
                ),
            }
        }
        if nodes.is_empty() {
            let minor = self.disk_minor.context(NoShareableDeviceSnafu {
                label: self.label.as_str(),
            })?;
            nodes.push((major, minor));
        }
        Ok(nodes)
    }

    /// Records a successful external mount.
    pub fn note_mounted(&mut self, major: u32, minor: u32) -> Result<()> {
        self.expect_state(VolumeState::Idle, "mount")?;
        self.mounted_device = Some((major, minor));
        self.set_state(VolumeState::Mounted);
        Ok(())
    }

    /// Records a successful external unmount.
    pub fn note_unmounted(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Mounted, "unmount")?;
        self.mounted_device = None;
        self.set_state(VolumeState::Idle);
        Ok(())
    }

    /// Marks the volume shared; the share coordinator calls this after the
    /// export slot write succeeds.
    pub fn note_shared(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Idle, "share")?;
        self.set_state(VolumeState::Shared);
        Ok(())
    }

    /// Returns the volume to idle after a host-side unshare. Export slot
    /// contents are left for a future share to overwrite.
    pub fn note_unshared(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Shared, "unshare")?;
        self.set_state(VolumeState::Idle);
        Ok(())
    }

    pub fn begin_checking(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Idle, "check")?;
        self.set_state(VolumeState::Checking);
        Ok(())
    }

    pub fn finish_checking(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Checking, "finish checking")?;
        self.set_state(VolumeState::Idle);
        Ok(())
    }

    pub fn begin_formatting(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Idle, "format")?;
        self.set_state(VolumeState::Formatting);
        Ok(())
    }

    pub fn finish_formatting(&mut self) -> Result<()> {
        self.expect_state(VolumeState::Formatting, "finish formatting")?;
        self.set_state(VolumeState::Idle);
        Ok(())
    }

    fn expect_state(&self, expected: VolumeState, op: &str) -> Result<()> {
        ensure!(
            self.state == expected,
            InvalidStateSnafu {
                label: self.label.as_str(),
                state: self.state.as_str(),
                op,
            }
        );
        Ok(())
    }

    fn set_state(&mut self, new: VolumeState) {
        if self.state == new {
            return;
        }
        debug!(
            "Volume {} state changing {} -> {}",
            self.label, self.state, new
        );
        self.state = new;
    }
}

fn read_major_minor(event: &Uevent) -> Option<(u32, u32)> {
    let major = event.find_param("MAJOR")?.parse().ok()?;
    let minor = event.find_param("MINOR")?.parse().ok()?;
    Some((major, minor))
}

fn clamp_part_count(label: &str, nparts: u32) -> u32 {
    if nparts > MAX_PARTITIONS {
        warn!(
            "Volume {}: kernel reports {} partitions, clamping to {}",
            label, nparts, MAX_PARTITIONS
        );
        MAX_PARTITIONS
    } else {
        nparts
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared test doubles for the external collaborator seams.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;
    use std::rc::Rc;

    use crate::broadcast::{Broadcaster, EventCode};
    use crate::error::{Error, Result};
    use crate::sys::{
        CheckVerdict, FsChecker, NodeCreator, Platform, SecondaryCleanup, SizeProbe, Unmounter,
    };

    /// Observable side effects, in emission order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Effect {
        Broadcast(EventCode),
        Node(String),
        Cleanup(String),
        Unmount,
    }

    #[derive(Default)]
    pub struct Recorder {
        pub effects: RefCell<Vec<Effect>>,
    }

    impl Recorder {
        pub fn effects(&self) -> Vec<Effect> {
            self.effects.borrow().clone()
        }

        pub fn broadcasts(&self, code: EventCode) -> usize {
            self.effects
                .borrow()
                .iter()
                .filter(|e| **e == Effect::Broadcast(code))
                .count()
        }
    }

    struct TestNodes {
        recorder: Rc<Recorder>,
        fail: bool,
    }

    impl NodeCreator for TestNodes {
        fn create_node(&self, path: &Path, _major: u32, _minor: u32) -> Result<()> {
            self.recorder
                .effects
                .borrow_mut()
                .push(Effect::Node(path.display().to_string()));
            if self.fail {
                return Err(Error::NodeCreation {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(())
        }
    }

    pub struct TestProbe(pub HashMap<String, u64>);

    impl SizeProbe for TestProbe {
        fn device_size(&self, devpath: &str) -> Option<u64> {
            self.0.get(devpath).copied()
        }
    }

    struct TestBroadcaster {
        recorder: Rc<Recorder>,
    }

    impl Broadcaster for TestBroadcaster {
        fn send_broadcast(&self, code: EventCode, _message: &str, _sticky: bool) {
            self.recorder
                .effects
                .borrow_mut()
                .push(Effect::Broadcast(code));
        }
    }

    pub struct StubChecker(pub CheckVerdict);

    impl FsChecker for StubChecker {
        fn check(&self, _device_path: &Path) -> CheckVerdict {
            self.0
        }
    }

    struct TestUnmounter {
        recorder: Rc<Recorder>,
        fail: bool,
    }

    impl Unmounter for TestUnmounter {
        fn force_unmount(&self, mount_point: &Path) -> Result<()> {
            self.recorder.effects.borrow_mut().push(Effect::Unmount);
            if self.fail {
                return Err(Error::Unmount {
                    path: mount_point.to_path_buf(),
                    message: "device is busy".to_string(),
                });
            }
            Ok(())
        }
    }

    struct TestCleanup {
        recorder: Rc<Recorder>,
    }

    impl SecondaryCleanup for TestCleanup {
        fn cleanup(&self, label: &str) -> Result<()> {
            self.recorder
                .effects
                .borrow_mut()
                .push(Effect::Cleanup(label.to_string()));
            Ok(())
        }
    }

    /// Platform wired to a shared effect recorder. Everything succeeds and
    /// the size probe knows nothing (all attributes unreadable).
    pub fn test_platform(recorder: &Rc<Recorder>) -> Platform {
        Platform {
            nodes: Box::new(TestNodes {
                recorder: Rc::clone(recorder),
                fail: false,
            }),
            probe: Box::new(TestProbe(HashMap::new())),
            broadcaster: Box::new(TestBroadcaster {
                recorder: Rc::clone(recorder),
            }),
            checker: Box::new(StubChecker(CheckVerdict::Clean)),
            unmounter: Box::new(TestUnmounter {
                recorder: Rc::clone(recorder),
                fail: false,
            }),
            cleanup: Box::new(TestCleanup {
                recorder: Rc::clone(recorder),
            }),
        }
    }

    /// Like [`test_platform`] but node creation fails.
    pub fn failing_node_platform(recorder: &Rc<Recorder>) -> Platform {
        let mut platform = test_platform(recorder);
        platform.nodes = Box::new(TestNodes {
            recorder: Rc::clone(recorder),
            fail: true,
        });
        platform
    }

    /// Like [`test_platform`] but forced unmount fails.
    pub fn failing_unmount_platform(recorder: &Rc<Recorder>) -> Platform {
        let mut platform = test_platform(recorder);
        platform.unmounter = Box::new(TestUnmounter {
            recorder: Rc::clone(recorder),
            fail: true,
        });
        platform
    }
}
