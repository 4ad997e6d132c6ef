//! Daemon configuration.
//!
//! One JSON document declares the physical volume slots the daemon manages,
//! plus the daemon-wide settings: which label marks the primary data volume
//! and which sysfs attributes back the USB mass-storage export slots. A
//! volume instance is created per entry at startup and lives for the
//! daemon's lifetime.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, ensure};

use crate::error::{ConfigInvalidSnafu, ConfigParseSnafu, IoResultExt, Result};
use crate::share;
use crate::topology::MAX_PARTITIONS;

/// Default label of the primary data volume.
pub const DEFAULT_PRIMARY_LABEL: &str = "sdcard";

/// One managed volume slot.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub label: String,
    pub mount_point: PathBuf,
    /// Device-subtree path prefixes this volume claims; an event belongs to
    /// the volume if its path starts with one of these.
    pub watched_paths: Vec<String>,
    /// Fixed partition number, or None to own the whole disk.
    #[serde(default)]
    pub partition: Option<u32>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub volumes: Vec<VolumeConfig>,
    #[serde(default = "default_primary_label")]
    pub primary_label: String,
    #[serde(default = "share::default_slot_paths")]
    pub export_slots: Vec<PathBuf>,
}

fn default_primary_label() -> String {
    DEFAULT_PRIMARY_LABEL.to_string()
}

impl Config {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        let config: Config =
            serde_json::from_str(&content).context(ConfigParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.volumes.is_empty(),
            ConfigInvalidSnafu {
                message: "no volumes configured",
            }
        );
        for volume in &self.volumes {
            ensure!(
                !volume.watched_paths.is_empty(),
                ConfigInvalidSnafu {
                    message: format!("volume '{}' has no watched paths", volume.label),
                }
            );
            if let Some(partition) = volume.partition {
                ensure!(
                    (1..=MAX_PARTITIONS).contains(&partition),
                    ConfigInvalidSnafu {
                        message: format!(
                            "volume '{}' partition {} is out of range (1..={})",
                            volume.label, partition, MAX_PARTITIONS
                        ),
                    }
                );
            }
        }
        let mut labels: Vec<&str> = self.volumes.iter().map(|v| v.label.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        ensure!(
            labels.len() == self.volumes.len(),
            ConfigInvalidSnafu {
                message: "duplicate volume labels",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"{
        "volumes": [
            {
                "label": "sdcard",
                "mount_point": "/mnt/sdcard",
                "watched_paths": [
                    "/devices/platform/mmc/block/mmcblk0",
                    "/devices/platform/usdhc/block/mmcblk1"
                ]
            },
            {
                "label": "extsd",
                "mount_point": "/mnt/extsd",
                "watched_paths": ["/devices/platform/usb/block/sda"],
                "partition": 1
            }
        ]
    }"#;

    fn load_str(content: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotvol.json");
        fs::write(&path, content).unwrap();
        Config::load(&path)
    }

    #[test]
    fn test_parse_sample_config() {
        let config = load_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].label, "sdcard");
        assert_eq!(config.volumes[0].watched_paths.len(), 2);
        assert_eq!(config.volumes[0].partition, None);
        assert_eq!(config.volumes[1].partition, Some(1));
    }

    #[test]
    fn test_defaults() {
        let config = load_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.primary_label, "sdcard");
        assert_eq!(config.export_slots, share::default_slot_paths());
    }

    #[test]
    fn test_no_volumes_is_invalid() {
        assert!(load_str(r#"{"volumes": []}"#).is_err());
    }

    #[test]
    fn test_missing_watched_paths_is_invalid() {
        let content = r#"{
            "volumes": [
                {"label": "a", "mount_point": "/mnt/a", "watched_paths": []}
            ]
        }"#;
        assert!(load_str(content).is_err());
    }

    #[test]
    fn test_partition_out_of_range_is_invalid() {
        let content = r#"{
            "volumes": [
                {"label": "a", "mount_point": "/mnt/a",
                 "watched_paths": ["/devices/x"], "partition": 0}
            ]
        }"#;
        assert!(load_str(content).is_err());
    }

    #[test]
    fn test_duplicate_labels_are_invalid() {
        let content = r#"{
            "volumes": [
                {"label": "a", "mount_point": "/mnt/a", "watched_paths": ["/devices/x"]},
                {"label": "a", "mount_point": "/mnt/b", "watched_paths": ["/devices/y"]}
            ]
        }"#;
        assert!(load_str(content).is_err());
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(load_str("{not json").is_err());
    }
}
