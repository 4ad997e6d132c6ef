//! Kernel hotplug event parsing.
//!
//! A uevent datagram is a sequence of NUL-terminated lines. The first line
//! is `<prefix>@<devpath>`; every following line is `KEY=value`. `ACTION`,
//! `SEQNUM` and `SUBSYSTEM` are lifted into typed fields, everything else is
//! kept verbatim (in arrival order) as parameters.

use snafu::ensure;

use crate::error::{MissingPathDelimiterSnafu, Result};

/// Receive buffer size for one uevent datagram.
pub const UEVENT_BUFFER_SIZE: usize = 64 * 1024;

/// What the kernel did to the device.
///
/// Defaults to `Add`; an unrecognized `ACTION` value leaves the default in
/// place rather than failing the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Add,
    Remove,
    Change,
}

impl Action {
    /// Parses a kernel action string. Returns None for anything that is not
    /// add/remove/change.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "change" => Some(Self::Change),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed hotplug event.
///
/// Produced fresh per received datagram, owned by the dispatch call that
/// parses it, and discarded after dispatch.
#[derive(Debug, Clone, Default)]
pub struct Uevent {
    /// Device path, i.e. the substring after the first `@` of the header line.
    pub path: String,
    pub action: Action,
    /// Empty when the datagram carried no `SUBSYSTEM` line.
    pub subsystem: String,
    pub seqnum: u64,
    /// Remaining `KEY=value` lines, in arrival order. Keys are unique per
    /// event in practice but duplicates are not rejected.
    pub params: Vec<(String, String)>,
}

impl Uevent {
    /// Parses one datagram buffer into an event.
    ///
    /// A header line without `@` is a fatal per-message error: the caller
    /// gets no record at all, never a partially-populated one. An empty or
    /// truncated read is the transport's problem and must be handled before
    /// calling this.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut event = Uevent::default();
        let mut saw_header = false;

        for raw in buf.split(|&b| b == 0) {
            if raw.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(raw);
            let line = text.as_ref();

            if !saw_header {
                let Some(at) = line.find('@') else {
                    return MissingPathDelimiterSnafu.fail();
                };
                event.path = line[at + 1..].to_string();
                saw_header = true;
            } else if let Some(value) = line.strip_prefix("ACTION=") {
                if let Some(action) = Action::parse(value) {
                    event.action = action;
                }
            } else if let Some(value) = line.strip_prefix("SEQNUM=") {
                event.seqnum = value.parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("SUBSYSTEM=") {
                event.subsystem = value.to_string();
            } else {
                let (key, value) = line.split_once('=').unwrap_or((line, ""));
                event.params.push((key.to_string(), value.to_string()));
            }
        }

        ensure!(saw_header, MissingPathDelimiterSnafu);
        Ok(event)
    }

    /// Builds an event without a raw datagram, for tests and for injecting
    /// synthetic events through the normal dispatch path.
    pub fn simulated(subsystem: impl Into<String>, path: impl Into<String>, action: Action) -> Self {
        Self {
            path: path.into(),
            action,
            subsystem: subsystem.into(),
            seqnum: 0,
            params: Vec::new(),
        }
    }

    /// Appends one `KEY=value` parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Returns the value of the first parameter with the given key.
    pub fn find_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(lines: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn test_parse_block_add() {
        let buf = datagram(&[
            "add@/devices/platform/mmc/block/mmcblk0",
            "ACTION=add",
            "DEVPATH=/devices/platform/mmc/block/mmcblk0",
            "SUBSYSTEM=block",
            "SEQNUM=1234",
            "MAJOR=179",
            "MINOR=0",
            "DEVTYPE=disk",
            "NPARTS=1",
        ]);

        let event = Uevent::parse(&buf).unwrap();
        assert_eq!(event.path, "/devices/platform/mmc/block/mmcblk0");
        assert_eq!(event.action, Action::Add);
        assert_eq!(event.subsystem, "block");
        assert_eq!(event.seqnum, 1234);
        assert_eq!(event.find_param("MAJOR"), Some("179"));
        assert_eq!(event.find_param("MINOR"), Some("0"));
        assert_eq!(event.find_param("NPARTS"), Some("1"));
        assert_eq!(event.find_param("SUBSYSTEM"), None);
    }

    #[test]
    fn test_params_preserve_order() {
        let buf = datagram(&["change@/devices/x", "B=2", "A=1", "C=3"]);
        let event = Uevent::parse(&buf).unwrap();
        let keys: Vec<&str> = event.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["B", "A", "C"]);
    }

    #[test]
    fn test_missing_at_delimiter_is_fatal() {
        let buf = datagram(&["garbage-header", "ACTION=add"]);
        assert!(Uevent::parse(&buf).is_err());
    }

    #[test]
    fn test_empty_buffer_is_an_error() {
        assert!(Uevent::parse(&[]).is_err());
    }

    #[test]
    fn test_unknown_action_keeps_default() {
        let buf = datagram(&["bind@/devices/x", "ACTION=bind"]);
        let event = Uevent::parse(&buf).unwrap();
        assert_eq!(event.action, Action::Add);
    }

    #[test]
    fn test_remove_action() {
        let buf = datagram(&["remove@/devices/x", "ACTION=remove"]);
        let event = Uevent::parse(&buf).unwrap();
        assert_eq!(event.action, Action::Remove);
    }

    #[test]
    fn test_value_containing_equals() {
        let buf = datagram(&["add@/devices/x", "CMDLINE=root=/dev/sda1"]);
        let event = Uevent::parse(&buf).unwrap();
        assert_eq!(event.find_param("CMDLINE"), Some("root=/dev/sda1"));
    }

    #[test]
    fn test_garbled_seqnum_defaults_to_zero() {
        let buf = datagram(&["add@/devices/x", "SEQNUM=banana"]);
        let event = Uevent::parse(&buf).unwrap();
        assert_eq!(event.seqnum, 0);
    }

    #[test]
    fn test_simulated_event() {
        let event = Uevent::simulated("block", "/devices/x", Action::Change)
            .with_param("MAJOR", "8")
            .with_param("MINOR", "1");
        assert_eq!(event.subsystem, "block");
        assert_eq!(event.action, Action::Change);
        assert_eq!(event.find_param("MAJOR"), Some("8"));
    }
}
