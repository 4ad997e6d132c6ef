//! Framework notification channel.
//!
//! The managing framework learns about media coming and going through
//! numbered broadcast events. The wire format of the channel itself is not
//! owned here; the core only decides when to emit which code.

use log::info;

/// Broadcast event codes consumed by the managing framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    DiskInserted = 630,
    DiskRemoved = 631,
    BadRemoval = 632,
}

impl EventCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Sink for framework broadcasts.
pub trait Broadcaster {
    fn send_broadcast(&self, code: EventCode, message: &str, sticky: bool);
}

/// Broadcaster binding that only logs, for running without a framework
/// connection.
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn send_broadcast(&self, code: EventCode, message: &str, sticky: bool) {
        info!("broadcast {} (sticky={}): {}", code.code(), sticky, message);
    }
}
