//! Events delivered to the main loop from signal, watcher and socket tasks.

use crate::control::{ControlCommand, ControlResponse};
use tokio::sync::{mpsc, oneshot};

/// Signals the init reacts to once bootstrap has installed its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSignal {
    /// SIGCHLD: one or more children exited
    Child,
    /// SIGHUP: reload configuration
    Hangup,
    /// SIGTERM or SIGINT: reboot
    Reboot,
    /// SIGUSR1: halt
    Halt,
    /// SIGUSR2: power off
    PowerOff,
}

/// Something for the main loop to handle.
#[derive(Debug)]
pub enum Event {
    Signal(InitSignal),
    /// The service snippet directory changed on disk
    ConfigChanged,
    /// A request from the control socket, answered through `reply`
    Control {
        command: ControlCommand,
        reply: oneshot::Sender<ControlResponse>,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the main loop's event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
