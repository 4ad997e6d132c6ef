//! Unified error types for the hotvol-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A uevent datagram whose header line carries no `@` path delimiter.
    ///
    /// The message must be dropped whole; no partially-populated record is
    /// ever produced.
    #[snafu(display("uevent message has no '@' path delimiter"))]
    MissingPathDelimiter,

    /// An action string that is not add/remove/change.
    #[snafu(display("unrecognized uevent action '{value}'"))]
    InvalidAction { value: String },

    /// A partition number outside the supported range.
    #[snafu(display("partition number {part_num} is out of range (1..={max})"))]
    PartitionOutOfRange { part_num: u32, max: u32 },

    /// Config file not found or cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid JSON.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Config parsed but fails validation.
    #[snafu(display("invalid config: {message}"))]
    ConfigInvalid { message: String },

    /// No configured volume carries the requested label.
    #[snafu(display("no volume with label '{label}'"))]
    UnknownVolume { label: String },

    /// The volume is not in the state the requested operation needs.
    #[snafu(display("volume '{label}' is {state}, cannot {op}"))]
    InvalidState {
        label: String,
        state: String,
        op: String,
    },

    /// Device node creation failed.
    #[snafu(display("failed to create device node at {}", path.display()))]
    NodeCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No candidate device node survived filesystem checking for a share.
    #[snafu(display("no shareable device for volume '{label}'"))]
    NoShareableDevice { label: String },

    /// A candidate device failed its filesystem check for a structural
    /// reason (as opposed to simply not holding the expected filesystem).
    #[snafu(display("{device} failed filesystem checks: {message}"))]
    FsckFailed { device: String, message: String },

    /// Every USB mass-storage export slot was occupied or unreadable.
    #[snafu(display("all usb mass-storage export slots are occupied or unavailable"))]
    ExportSlotsExhausted,

    /// Writing the device node path into an export slot failed.
    #[snafu(display("failed to write export slot at {}", path.display()))]
    ExportSlotWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Forced unmount failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    Unmount { path: PathBuf, message: String },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Failed to open or bind the kernel uevent socket.
    #[snafu(display("failed to open uevent socket"))]
    UeventSocket { source: std::io::Error },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for device node creation errors.
    fn node_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for export slot write errors.
    fn slot_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for uevent socket errors.
    fn socket_context(self) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn node_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(NodeCreationSnafu { path: path.into() })
    }

    fn slot_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ExportSlotWriteSnafu { path: path.into() })
    }

    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn socket_context(self) -> Result<T> {
        self.context(UeventSocketSnafu)
    }
}
