//! Buckos init - a small PID 1 that brings the system up.
//!
//! This crate takes the system from kernel handoff to its default runlevel
//! and then stays around as the parent of every orphan. It handles:
//!
//! - Kernel command line flags (rescue, single, debug, runlevel)
//! - Multi-pass filesystem checks and the read-write remount of `/`
//! - Hook points and one-shot conditions for each boot milestone
//! - Bootstrap run/task entries, gated for at most 120 seconds
//! - Services, TTYs and runlevel changes once bootstrap is over
//! - Signals and a control socket
//!
//! # Architecture
//!
//! - **Boot**: the sequencer, owner of all state and of the main loop
//! - **Scheduler**: deferred work items, run from the main loop
//! - **CompletionGate**: the bounded wait for bootstrap tasks
//! - **ServiceRegistry**: service, task, run and TTY entries
//! - **Host**: everything that touches process-wide OS state
//!
//! # Example
//!
//! ```no_run
//! use buckos_init::{Boot, BootParams, Collaborators, LogControl, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let params = BootParams::parse(std::env::args().skip(1));
//!     let log = LogControl::install(LogLevel::from_params(&params));
//!     let runtime = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()?;
//!     let mut boot = Boot::new(&params, log, Collaborators::system());
//!     runtime.block_on(boot.start())?;
//!     Ok(())
//! }
//! ```

pub mod boot;
pub mod cmdline;
pub mod cond;
pub mod conf;
pub mod console;
pub mod control;
pub mod emergency;
pub mod error;
pub mod events;
pub mod exec;
pub mod fsck;
pub mod hooks;
pub mod host;
pub mod logging;
pub mod schedule;
pub mod service;
pub mod state;

// Re-export main types
pub use boot::{Boot, Collaborators, Completion};
pub use cmdline::BootParams;
pub use cond::{CondStore, Conditions};
pub use conf::{ConfLoader, ConfigSource, InitConfig};
pub use control::{ApiResponder, ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use error::{Error, Result};
pub use events::{Event, EventSender, InitSignal};
pub use exec::{CommandRunner, SystemRunner};
pub use fsck::{FsProbe, Fstab, FstabEntry, FsckOutcome, RemountDecision};
pub use hooks::{HookPoint, HookRegistry, Plugins};
pub use host::{ExitStatus, Host, LinuxHost, ShutdownType};
pub use logging::{LogControl, LogLevel};
pub use schedule::{CompletionGate, GateVerdict, Scheduler, WorkItem, WorkOutcome};
pub use service::{
    ServiceDefinition, ServiceFilter, ServiceKind, ServiceLayer, ServiceRegistry, ServiceState,
    ServiceStatus,
};
pub use state::{BootState, Runlevel};
