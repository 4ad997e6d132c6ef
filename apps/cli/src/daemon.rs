//! Daemon mode: the blocking uevent receive loop.
//!
//! The loop owns the netlink socket for its whole life and handles one
//! datagram to completion before reading the next, so the volume state
//! machines never see interleaved events. Per-message failures (transport
//! hiccups, unparseable datagrams, handler errors) are logged and the
//! message dropped; nothing here terminates the process.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use log::{error, warn};

use hotvol_core::config::Config;
use hotvol_core::dispatch::EventRouter;
use hotvol_core::error::{InvalidActionSnafu, IoResultExt, Result};
use hotvol_core::sys::Platform;
use hotvol_core::uevent::UEVENT_BUFFER_SIZE;
use hotvol_core::{Action, Uevent, VolumeManager};

/// Builds the dispatch table for a config: one volume manager handling the
/// whole block subsystem.
fn build_router(config: &Config) -> EventRouter {
    let manager = VolumeManager::from_config(config, Platform::native());
    let mut router = EventRouter::new();
    router.register_subsystem("block", Box::new(manager));
    router
}

/// Runs the daemon until killed.
pub fn run_daemon(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let mut router = build_router(&config);

    let socket = open_uevent_socket()?;
    let mut buf = vec![0u8; UEVENT_BUFFER_SIZE];

    loop {
        let count = match nix::sys::socket::recv(
            socket.as_raw_fd(),
            &mut buf,
            nix::sys::socket::MsgFlags::empty(),
        ) {
            Ok(0) => {
                error!("empty read from uevent socket");
                continue;
            }
            Ok(count) => count,
            Err(errno) => {
                error!("error receiving uevent ({})", errno);
                continue;
            }
        };

        let event = match Uevent::parse(&buf[..count]) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed uevent: {}", e);
                continue;
            }
        };

        if let Err(e) = router.dispatch(&event) {
            error!("error handling uevent for '{}': {}", event.path, e);
        }
    }
}

/// Opens and binds the kernel uevent netlink socket.
fn open_uevent_socket() -> Result<OwnedFd> {
    use nix::sys::socket::{
        AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, socket,
    };

    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::empty(),
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(std::io::Error::from)
    .socket_context()?;

    // Group 1 carries the kernel's hotplug broadcasts.
    let addr = NetlinkAddr::new(std::process::id(), 1);
    bind(fd.as_raw_fd(), &addr)
        .map_err(std::io::Error::from)
        .socket_context()?;

    Ok(fd)
}

/// Builds a simulated event and runs it through the same dispatch path the
/// daemon uses.
pub fn run_inject(
    config_path: &Path,
    subsystem: &str,
    devpath: &str,
    action: &str,
    params: &[String],
) -> Result<()> {
    let config = Config::load(config_path)?;
    let mut router = build_router(&config);

    let action = Action::parse(action).ok_or_else(|| {
        InvalidActionSnafu { value: action }.build()
    })?;
    let mut event = Uevent::simulated(subsystem, devpath, action);
    for param in params {
        let (key, value) = param.split_once('=').unwrap_or((param.as_str(), ""));
        event = event.with_param(key, value);
    }

    let handled = router.dispatch(&event)?;
    if !handled {
        warn!("no handler claimed the injected event");
    }
    Ok(())
}
