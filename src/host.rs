//! PID 1 duties that touch the operating system directly.

use crate::error::Result;
use crate::events::{Event, EventSender, InitSignal};
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, set_cad_enabled, RebootMode};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

/// Search path every descendant inherits.
pub const PATH_STDPATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Shell every descendant inherits.
pub const PATH_BSHELL: &str = "/bin/sh";

/// Where the unified cgroup hierarchy is mounted.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Signals ignored from the first instant of boot until handlers go in.
/// SIGCHLD stays default, the early boot tools are waited for.
pub const BOOT_IGNORED_SIGNALS: [Signal; 8] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTSTP,
    Signal::SIGPWR,
];

/// What each handled signal means to the main loop.
pub const SIGNAL_EVENTS: [(Signal, InitSignal); 7] = [
    (Signal::SIGCHLD, InitSignal::Child),
    (Signal::SIGHUP, InitSignal::Hangup),
    (Signal::SIGTERM, InitSignal::Reboot),
    (Signal::SIGINT, InitSignal::Reboot),
    (Signal::SIGUSR1, InitSignal::Halt),
    (Signal::SIGUSR2, InitSignal::PowerOff),
    (Signal::SIGPWR, InitSignal::PowerOff),
];

/// Exit status of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

/// Type of shutdown to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownType {
    /// Power off the system
    PowerOff,
    /// Reboot the system
    Reboot,
    /// Halt the system
    Halt,
}

/// Process-wide operating system effects used by the sequencer.
pub trait Host {
    /// Set an environment variable inherited by every child.
    fn set_env(&mut self, key: &str, value: &str);

    fn chdir(&mut self, dir: &Path) -> Result<()>;

    /// Set the file creation mask.
    fn umask(&mut self, mask: u32);

    fn is_dir(&self, path: &Path) -> bool;

    fn is_executable(&self, path: &Path) -> bool;

    fn set_hostname(&mut self, name: &str) -> Result<()>;

    /// Ignore signals until the handlers that need them exist.
    fn ignore_signals(&mut self);

    /// Install the full signal set, forwarding deliveries to `events`.
    fn install_signals(&mut self, events: EventSender) -> Result<()>;

    /// Set up the cgroup hierarchy. `Ok(false)` when the kernel has no support.
    fn cgroup_init(&mut self) -> Result<bool>;

    /// Collect every exited child without blocking.
    fn reap(&mut self) -> Vec<ExitStatus>;

    /// Sync disks and halt, reboot or power off.
    fn shutdown(&mut self, kind: ShutdownType) -> Result<()>;
}

/// The real thing.
#[derive(Debug, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

fn cgroup2_supported() -> bool {
    std::fs::read_to_string("/proc/filesystems")
        .map(|fs| fs.lines().any(|line| line.split_whitespace().last() == Some("cgroup2")))
        .unwrap_or(false)
}

fn cgroup2_mounted() -> bool {
    std::fs::read_to_string("/proc/mounts")
        .map(|mounts| {
            mounts.lines().any(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                fields.len() > 2 && fields[1] == CGROUP_ROOT && fields[2] == "cgroup2"
            })
        })
        .unwrap_or(false)
}

impl Host for LinuxHost {
    fn set_env(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn chdir(&mut self, dir: &Path) -> Result<()> {
        nix::unistd::chdir(dir)?;
        Ok(())
    }

    fn umask(&mut self, mask: u32) {
        umask(Mode::from_bits_truncate(mask));
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_executable(&self, path: &Path) -> bool {
        crate::exec::is_executable(path)
    }

    fn set_hostname(&mut self, name: &str) -> Result<()> {
        nix::unistd::sethostname(name)?;
        Ok(())
    }

    fn ignore_signals(&mut self) {
        for sig in BOOT_IGNORED_SIGNALS {
            if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
                error!(signal = ?sig, error = %e, "Failed to ignore signal");
            }
        }
    }

    fn install_signals(&mut self, events: EventSender) -> Result<()> {
        // Ctrl-Alt-Del arrives as SIGINT instead of an instant reboot
        if let Err(e) = set_cad_enabled(false) {
            debug!(error = %e, "Cannot route Ctrl-Alt-Del to init");
        }

        for (sig, event) in SIGNAL_EVENTS {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let events = events.clone();

            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if events.send(Event::Signal(event)).is_err() {
                        break;
                    }
                }
            });
        }

        info!("Signal handlers installed");
        Ok(())
    }

    fn cgroup_init(&mut self) -> Result<bool> {
        if !cgroup2_supported() {
            return Ok(false);
        }
        if cgroup2_mounted() {
            debug!(path = CGROUP_ROOT, "cgroup2 already mounted");
            return Ok(true);
        }

        std::fs::create_dir_all(CGROUP_ROOT)?;
        mount(
            Some("cgroup2"),
            CGROUP_ROOT,
            Some("cgroup2"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;

        info!(target = CGROUP_ROOT, "Mounted cgroup2 hierarchy");
        Ok(true)
    }

    fn reap(&mut self) -> Vec<ExitStatus> {
        let mut statuses = Vec::new();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    debug!(pid = pid.as_raw(), code = code, "Reaped process");
                    statuses.push(ExitStatus {
                        pid: pid.as_raw() as u32,
                        code: Some(code),
                        signal: None,
                    });
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    debug!(pid = pid.as_raw(), signal = ?sig, "Reaped signaled process");
                    statuses.push(ExitStatus {
                        pid: pid.as_raw() as u32,
                        code: None,
                        signal: Some(sig as i32),
                    });
                }
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "Error reaping children");
                    break;
                }
            }
        }

        statuses
    }

    fn shutdown(&mut self, kind: ShutdownType) -> Result<()> {
        info!(shutdown_type = ?kind, "Shutting down");
        nix::unistd::sync();

        let mode = match kind {
            ShutdownType::PowerOff => RebootMode::RB_POWER_OFF,
            ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
            ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        };

        reboot(mode)?;
        Ok(())
    }
}
