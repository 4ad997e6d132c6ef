//! Uevent routing.
//!
//! Handlers register for a subsystem or for an exact device path. Each
//! incoming event is matched against the table in registration order and
//! handed to the first entry that claims it; events nobody claims are
//! silently dropped.

use log::trace;

use crate::error::Result;
use crate::uevent::Uevent;

/// Something that consumes routed uevents.
pub trait UeventHandler {
    fn handle_uevent(&mut self, event: &Uevent) -> Result<()>;
}

struct Registration {
    subsystem: Option<String>,
    devpath: Option<String>,
    handler: Box<dyn UeventHandler>,
}

impl Registration {
    fn matches_devpath(&self, event: &Uevent) -> bool {
        self.devpath.as_deref() == Some(event.path.as_str())
    }

    fn matches_subsystem(&self, event: &Uevent) -> bool {
        self.subsystem.as_deref() == Some(event.subsystem.as_str())
    }
}

/// Dispatch table mapping subsystems and exact device paths to handlers.
#[derive(Default)]
pub struct EventRouter {
    table: Vec<Registration>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every event of a subsystem.
    pub fn register_subsystem(&mut self, subsystem: impl Into<String>, handler: Box<dyn UeventHandler>) {
        self.table.push(Registration {
            subsystem: Some(subsystem.into()),
            devpath: None,
            handler,
        });
    }

    /// Registers a handler for one exact device path, regardless of subsystem.
    pub fn register_devpath(&mut self, devpath: impl Into<String>, handler: Box<dyn UeventHandler>) {
        self.table.push(Registration {
            subsystem: None,
            devpath: Some(devpath.into()),
            handler,
        });
    }

    /// Routes one event. An exact device-path registration always beats a
    /// subsystem registration; ties fall to registration order. Returns
    /// whether any handler claimed the event.
    pub fn dispatch(&mut self, event: &Uevent) -> Result<bool> {
        for reg in &mut self.table {
            if reg.matches_devpath(event) {
                reg.handler.handle_uevent(event)?;
                return Ok(true);
            }
        }
        for reg in &mut self.table {
            if reg.matches_subsystem(event) {
                reg.handler.handle_uevent(event)?;
                return Ok(true);
            }
        }
        trace!(
            "no uevent handler registered for subsystem '{}' (path '{}')",
            event.subsystem, event.path
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uevent::Action;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter(Rc<Cell<u32>>);

    impl UeventHandler for Counter {
        fn handle_uevent(&mut self, _event: &Uevent) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    fn counting_router(entries: &[(&str, bool)]) -> (EventRouter, Vec<Rc<Cell<u32>>>) {
        let mut router = EventRouter::new();
        let mut counts = Vec::new();
        for (name, by_path) in entries {
            let count = Rc::new(Cell::new(0));
            counts.push(Rc::clone(&count));
            if *by_path {
                router.register_devpath(*name, Box::new(Counter(count)));
            } else {
                router.register_subsystem(*name, Box::new(Counter(count)));
            }
        }
        (router, counts)
    }

    #[test]
    fn test_subsystem_match() {
        let (mut router, counts) = counting_router(&[("block", false)]);
        let event = Uevent::simulated("block", "/devices/x", Action::Add);
        assert!(router.dispatch(&event).unwrap());
        assert_eq!(counts[0].get(), 1);
    }

    #[test]
    fn test_exact_devpath_match() {
        let (mut router, counts) = counting_router(&[("/devices/platform/usb0", true)]);
        let event = Uevent::simulated("usb", "/devices/platform/usb0", Action::Change);
        assert!(router.dispatch(&event).unwrap());
        assert_eq!(counts[0].get(), 1);
    }

    #[test]
    fn test_devpath_must_match_exactly() {
        let (mut router, counts) = counting_router(&[("/devices/platform/usb0", true)]);
        let event = Uevent::simulated("usb", "/devices/platform/usb0/port1", Action::Add);
        assert!(!router.dispatch(&event).unwrap());
        assert_eq!(counts[0].get(), 0);
    }

    #[test]
    fn test_first_registration_wins() {
        let (mut router, counts) = counting_router(&[("block", false), ("block", false)]);
        let event = Uevent::simulated("block", "/devices/x", Action::Add);
        router.dispatch(&event).unwrap();
        assert_eq!(counts[0].get(), 1);
        assert_eq!(counts[1].get(), 0);
    }

    #[test]
    fn test_devpath_registration_beats_subsystem_registration() {
        let (mut router, counts) =
            counting_router(&[("block", false), ("/devices/platform/usb0", true)]);
        let event = Uevent::simulated("block", "/devices/platform/usb0", Action::Add);
        router.dispatch(&event).unwrap();
        assert_eq!(counts[0].get(), 0);
        assert_eq!(counts[1].get(), 1);
    }

    #[test]
    fn test_unmatched_event_is_dropped() {
        let (mut router, counts) = counting_router(&[("block", false)]);
        let event = Uevent::simulated("net", "/devices/net/eth0", Action::Add);
        assert!(!router.dispatch(&event).unwrap());
        assert_eq!(counts[0].get(), 0);
    }
}
