//! Service, task and TTY bookkeeping, and the runlevel state machine.
//!
//! Each entry is started when the current runlevel declares it and stopped
//! when it no longer does. One-shot entries are remembered as done so
//! bootstrap can tell when it is over.

use crate::error::{Error, Result};
use crate::state::Runlevel;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

/// Times a crashed service is restarted before it is left failed.
pub const MAX_RESTARTS: u32 = 5;

/// How an entry is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Long running daemon, restarted when it exits
    #[default]
    Service,
    /// One-shot job, runs once per runlevel it is declared for
    Task,
    /// Like a task, but nothing else starts while it runs
    Run,
    /// Login session, only started once bootstrap hands over the TTYs
    Tty,
}

impl ServiceKind {
    pub fn is_oneshot(self) -> bool {
        matches!(self, ServiceKind::Task | ServiceKind::Run)
    }
}

/// Which entries a step applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFilter {
    Any,
    Kind(ServiceKind),
}

impl ServiceFilter {
    fn matches(self, kind: ServiceKind) -> bool {
        match self {
            ServiceFilter::Any => true,
            ServiceFilter::Kind(k) => k == kind,
        }
    }
}

/// Current state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running, may be started
    #[default]
    Halted,
    /// Process is alive
    Running,
    /// Asked to stop, waiting for it to exit
    Stopping,
    /// One-shot finished successfully
    Done,
    /// One-shot failed, or a service ran out of restarts
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Halted => write!(f, "halted"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Done => write!(f, "done"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

fn default_runlevels() -> String {
    "2345".to_string()
}

/// Service definition as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// How the entry is run
    #[serde(default)]
    pub kind: ServiceKind,
    /// Command line, split on whitespace
    pub exec: String,
    /// Runlevels the entry belongs to, e.g. `"S"` or `"2345"`
    #[serde(default = "default_runlevels")]
    pub runlevels: String,
    /// Extra environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ServiceDefinition {
    /// Create a service with default runlevels.
    pub fn new(name: impl Into<String>, exec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: ServiceKind::default(),
            exec: exec.into(),
            runlevels: default_runlevels(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_runlevels(mut self, runlevels: impl Into<String>) -> Self {
        self.runlevels = runlevels.into();
        self
    }

    fn levels(&self) -> impl Iterator<Item = Runlevel> + '_ {
        self.runlevels.chars().filter_map(Runlevel::from_char)
    }

    /// Whether the entry is declared for `level`.
    pub fn runs_in(&self, level: Runlevel) -> bool {
        self.levels().any(|l| l == level)
    }

    /// Declared for bootstrap and nothing else.
    pub fn bootstrap_only(&self) -> bool {
        self.runs_in(Runlevel::Bootstrap) && self.levels().all(|l| l == Runlevel::Bootstrap)
    }
}

/// Runtime information about one entry.
#[derive(Debug, Clone, Default)]
pub struct ServiceInstance {
    /// Current state
    pub state: ServiceState,
    /// Process ID while running
    pub pid: Option<u32>,
    /// When the current or last process started
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the last process
    pub exit_code: Option<i32>,
    /// Number of restarts after crashes
    pub restart_count: u32,
    /// Whether a process was ever started
    pub ran: bool,
}

/// Service status information for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub description: String,
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub runlevels: String,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
}

impl ServiceStatus {
    fn from_entry(def: &ServiceDefinition, inst: &ServiceInstance) -> Self {
        let uptime_secs = match (inst.state, inst.started_at) {
            (ServiceState::Running, Some(start)) => {
                Some(Utc::now().signed_duration_since(start).num_seconds().max(0) as u64)
            }
            _ => None,
        };

        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            kind: def.kind,
            state: inst.state,
            runlevels: def.runlevels.clone(),
            pid: inst.pid,
            uptime_secs,
            restart_count: inst.restart_count,
        }
    }
}

/// Starts and signals processes for the registry.
pub trait Spawner {
    /// Start the entry's process and return its PID without waiting for it.
    fn spawn(&mut self, def: &ServiceDefinition) -> Result<u32>;

    /// Send a signal to a process started earlier.
    fn signal(&mut self, pid: u32, sig: Signal) -> Result<()>;
}

/// Spawns real processes, each in its own session. Exits are collected by
/// the init's SIGCHLD handling, not here.
#[derive(Debug, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, def: &ServiceDefinition) -> Result<u32> {
        let parts: Vec<&str> = def.exec.split_whitespace().collect();
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| Error::Spawn(format!("{}: empty exec", def.name)))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&def.environment);
        cmd.stdin(Stdio::null());

        // Create new session for the process
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", def.exec, e)))?;

        Ok(child.id())
    }

    fn signal(&mut self, pid: u32, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        Ok(())
    }
}

/// The service layer as the sequencer sees it.
pub trait ServiceLayer {
    /// Add a definition. Names are unique.
    fn register(&mut self, def: ServiceDefinition) -> Result<()>;

    /// Reset the state machine to bootstrap.
    fn sm_init(&mut self);

    /// Advance the state machine one step.
    fn sm_step(&mut self);

    /// Switch to `level` and start everything declared for it.
    fn runlevel(&mut self, level: u8);

    /// Advance every entry matching `filter` one step.
    fn step_all(&mut self, filter: ServiceFilter);

    /// True when no one-shot declared for bootstrap is still pending.
    fn completed(&self) -> bool;

    /// Drop bootstrap-only entries that never ran.
    fn prune_bootstrap(&mut self);

    /// Allow TTY entries to start and start those of the current level.
    fn tty_runlevel(&mut self);

    /// A child exited. Returns whether it belonged to an entry.
    fn handle_exit(&mut self, pid: u32, code: Option<i32>, signal: Option<i32>) -> bool;

    /// Status of every entry, in registration order.
    fn statuses(&self) -> Vec<ServiceStatus>;

    /// Ask every running entry to stop.
    fn stop_all(&mut self);
}

struct Entry {
    def: ServiceDefinition,
    inst: ServiceInstance,
}

/// Registry of configured entries, kept in registration order.
pub struct ServiceRegistry {
    entries: Vec<Entry>,
    level: Runlevel,
    ttys_enabled: bool,
    spawner: Box<dyn Spawner>,
}

impl ServiceRegistry {
    pub fn new(spawner: Box<dyn Spawner>) -> Self {
        Self {
            entries: Vec::new(),
            level: Runlevel::Bootstrap,
            ttys_enabled: false,
            spawner,
        }
    }

    pub fn level(&self) -> Runlevel {
        self.level
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.def.name == name)
    }

    /// State of a named entry.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.entries
            .iter()
            .find(|e| e.def.name == name)
            .map(|e| e.inst.state)
    }

    fn run_active(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.def.kind == ServiceKind::Run && e.inst.state == ServiceState::Running)
    }

    fn wanted(&self, def: &ServiceDefinition) -> bool {
        def.runs_in(self.level) && (def.kind != ServiceKind::Tty || self.ttys_enabled)
    }

    fn start(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        match self.spawner.spawn(&entry.def) {
            Ok(pid) => {
                info!(service = %entry.def.name, pid = pid, "Started");
                entry.inst.state = ServiceState::Running;
                entry.inst.pid = Some(pid);
                entry.inst.started_at = Some(Utc::now());
                entry.inst.ran = true;
            }
            Err(e) => {
                error!(service = %entry.def.name, error = %e, "Failed to start");
                entry.inst.state = ServiceState::Failed;
            }
        }
    }

    fn stop(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        let Some(pid) = entry.inst.pid else {
            entry.inst.state = ServiceState::Halted;
            return;
        };

        info!(service = %entry.def.name, pid = pid, "Stopping");
        match self.spawner.signal(pid, Signal::SIGTERM) {
            Ok(()) => entry.inst.state = ServiceState::Stopping,
            Err(e) => {
                warn!(service = %entry.def.name, error = %e, "Failed to signal, assuming gone");
                entry.inst.state = ServiceState::Halted;
                entry.inst.pid = None;
            }
        }
    }
}

impl ServiceLayer for ServiceRegistry {
    fn register(&mut self, def: ServiceDefinition) -> Result<()> {
        if self.contains(&def.name) {
            return Err(Error::ServiceAlreadyExists(def.name));
        }

        debug!(service = %def.name, kind = ?def.kind, runlevels = %def.runlevels, "Registered");
        self.entries.push(Entry {
            def,
            inst: ServiceInstance::default(),
        });
        Ok(())
    }

    fn sm_init(&mut self) {
        self.level = Runlevel::Bootstrap;
        self.ttys_enabled = false;
        debug!(entries = self.entries.len(), "State machine initialized");
    }

    fn sm_step(&mut self) {
        self.step_all(ServiceFilter::Any);
    }

    fn runlevel(&mut self, level: u8) {
        let level = Runlevel::Level(level);
        info!(from = %self.level, to = %level, "Changing runlevel");
        self.level = level;

        for entry in &mut self.entries {
            if entry.def.kind.is_oneshot()
                && entry.def.runs_in(level)
                && matches!(entry.inst.state, ServiceState::Done | ServiceState::Failed)
            {
                entry.inst.state = ServiceState::Halted;
            }
        }

        self.step_all(ServiceFilter::Any);
    }

    fn step_all(&mut self, filter: ServiceFilter) {
        let mut blocked = self.run_active();

        for idx in 0..self.entries.len() {
            let entry = &self.entries[idx];
            if !filter.matches(entry.def.kind) {
                continue;
            }

            let wanted = self.wanted(&entry.def);
            let kind = entry.def.kind;
            let state = entry.inst.state;
            match state {
                ServiceState::Halted if wanted && !blocked => {
                    self.start(idx);
                    if kind == ServiceKind::Run && self.entries[idx].inst.state == ServiceState::Running {
                        blocked = true;
                    }
                }
                ServiceState::Running if !wanted => self.stop(idx),
                _ => {}
            }
        }
    }

    fn completed(&self) -> bool {
        !self.entries.iter().any(|e| {
            e.def.kind.is_oneshot()
                && e.def.runs_in(Runlevel::Bootstrap)
                && matches!(e.inst.state, ServiceState::Halted | ServiceState::Running)
        })
    }

    fn prune_bootstrap(&mut self) {
        self.entries.retain(|e| {
            let stale = e.def.bootstrap_only() && !e.inst.ran && e.inst.state == ServiceState::Halted;
            if stale {
                debug!(service = %e.def.name, "Pruning bootstrap-only entry that never ran");
            }
            !stale
        });
    }

    fn tty_runlevel(&mut self) {
        self.ttys_enabled = true;
        self.step_all(ServiceFilter::Kind(ServiceKind::Tty));
    }

    fn handle_exit(&mut self, pid: u32, code: Option<i32>, signal: Option<i32>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.inst.pid == Some(pid)) else {
            return false;
        };

        let success = code == Some(0);
        info!(
            service = %entry.def.name,
            pid = pid,
            code = ?code,
            signal = ?signal,
            "Process exited"
        );

        entry.inst.pid = None;
        entry.inst.exit_code = code;

        let next = match (entry.def.kind.is_oneshot(), entry.inst.state) {
            (true, _) if success => ServiceState::Done,
            (true, _) => ServiceState::Failed,
            (false, ServiceState::Stopping) => ServiceState::Halted,
            (false, _) if entry.inst.restart_count < MAX_RESTARTS => {
                entry.inst.restart_count += 1;
                ServiceState::Halted
            }
            (false, _) => {
                warn!(
                    service = %entry.def.name,
                    restart_count = entry.inst.restart_count,
                    "Service exceeded max restart count"
                );
                ServiceState::Failed
            }
        };
        entry.inst.state = next;

        true
    }

    fn statuses(&self) -> Vec<ServiceStatus> {
        self.entries
            .iter()
            .map(|e| ServiceStatus::from_entry(&e.def, &e.inst))
            .collect()
    }

    fn stop_all(&mut self) {
        for idx in 0..self.entries.len() {
            if self.entries[idx].inst.state == ServiceState::Running {
                self.stop(idx);
            }
        }
    }
}
