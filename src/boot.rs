//! Boot sequencer - takes the system from kernel handoff to the default runlevel.
//!
//! `bootstrap` runs the fixed stage order synchronously, then hands two work
//! items to the scheduler: one that cranks the service state machine, and
//! one that polls for bootstrap completion once a second. When the polling
//! item sees completion, or its gate runs out, it calls `finalize` which
//! moves to the configured runlevel. After that the main loop only serves
//! signals, config changes and control requests.

use crate::cmdline::BootParams;
use crate::cond::{CondStore, Conditions};
use crate::conf::{ConfLoader, ConfigSource};
use crate::console::{Console, INIT_HEADING};
use crate::control::{ApiResponder, ControlCommand, ControlResponse, ControlServer, SystemStatus};
use crate::emergency;
use crate::events::{self, Event, EventReceiver, EventSender, InitSignal};
use crate::exec::{self, CommandRunner, Interactive, SystemRunner};
use crate::fsck::{self, FsProbe, SystemProbe, FSTAB};
use crate::hooks::{HookPoint, HookRegistry, Plugins, DEFAULT_HOOKS_DIR};
use crate::host::{Host, LinuxHost, ShutdownType, PATH_BSHELL, PATH_STDPATH};
use crate::logging::LogControl;
use crate::schedule::{
    CompletionGate, GateVerdict, Scheduler, WorkItem, WorkOutcome, GATE_INTERVAL,
};
use crate::service::{ProcessSpawner, ServiceFilter, ServiceLayer, ServiceRegistry};
use crate::state::{BootState, Runlevel};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Operator script run at the end of bootstrap.
pub const RC_LOCAL: &str = "/etc/rc.local";

/// How long services get to exit before the system goes down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The collaborators the sequencer drives.
pub struct Collaborators {
    pub host: Box<dyn Host>,
    pub runner: Rc<dyn CommandRunner>,
    pub probe: Box<dyn FsProbe>,
    pub plugins: Box<dyn Plugins>,
    pub services: Box<dyn ServiceLayer>,
    pub conditions: Box<dyn Conditions>,
    pub config: Box<dyn ConfigSource>,
    pub api: Box<dyn ApiResponder>,
}

impl Collaborators {
    /// The real thing, at the default paths.
    pub fn system() -> Self {
        let runner: Rc<dyn CommandRunner> = Rc::new(SystemRunner::new());
        Self {
            host: Box::new(LinuxHost::new()),
            runner: Rc::clone(&runner),
            probe: Box::new(SystemProbe::default()),
            plugins: Box::new(HookRegistry::new(Some(PathBuf::from(DEFAULT_HOOKS_DIR)), runner)),
            services: Box::new(ServiceRegistry::new(Box::new(ProcessSpawner))),
            conditions: Box::new(CondStore::default()),
            config: Box::new(ConfLoader::default()),
            api: Box::new(ControlServer::with_default_path()),
        }
    }
}

/// How the completion gate let bootstrap go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every bootstrap task finished, observed on this tick
    AllCompleted { tick: u32 },
    /// The gate ran out on this tick with tasks still pending
    TimedOut { tick: u32 },
}

/// The init process.
pub struct Boot {
    state: BootState,
    log: LogControl,
    console: Console,
    host: Box<dyn Host>,
    runner: Rc<dyn CommandRunner>,
    probe: Box<dyn FsProbe>,
    plugins: Box<dyn Plugins>,
    services: Box<dyn ServiceLayer>,
    conditions: Box<dyn Conditions>,
    config: Box<dyn ConfigSource>,
    api: Box<dyn ApiResponder>,
    events_tx: EventSender,
    events_rx: Option<EventReceiver>,
    conditions_ready: bool,
    completion: Option<Completion>,
    fstab: PathBuf,
    rc_local: PathBuf,
}

impl Boot {
    pub fn new(params: &BootParams, log: LogControl, parts: Collaborators) -> Self {
        let (events_tx, events_rx) = events::channel();
        Self {
            state: BootState::new(params),
            log,
            console: Console::new(),
            host: parts.host,
            runner: parts.runner,
            probe: parts.probe,
            plugins: parts.plugins,
            services: parts.services,
            conditions: parts.conditions,
            config: parts.config,
            api: parts.api,
            events_tx,
            events_rx: Some(events_rx),
            conditions_ready: false,
            completion: None,
            fstab: PathBuf::from(FSTAB),
            rc_local: PathBuf::from(RC_LOCAL),
        }
    }

    /// Use a different filesystem table.
    pub fn with_fstab(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab = path.into();
        self
    }

    /// Use a different operator script.
    pub fn with_rc_local(mut self, path: impl Into<PathBuf>) -> Self {
        self.rc_local = path.into();
        self
    }

    pub fn state(&self) -> &BootState {
        &self.state
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn log(&self) -> &LogControl {
        &self.log
    }

    /// How bootstrap was let go, once it has been.
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// A sender into the main loop, for event sources outside the sequencer.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    fn interactive(&self) -> Interactive<'_> {
        Interactive::new(&*self.runner, &self.console)
    }

    /// Run plugin hooks for `point`, recording its condition when possible.
    fn run_hooks(&mut self, point: HookPoint) {
        debug!(hook = %point, "Running hooks");
        self.plugins.run_hooks(point);
        if self.conditions_ready {
            self.conditions.set_oneshot(point.cond_name());
        }
    }

    /// Bring the system up to the point where services can start.
    ///
    /// Every stage runs exactly once, in order. Failures are reported and
    /// the sequence continues. Returns the scheduler with the crank and
    /// completion work queued.
    pub fn bootstrap(&mut self) -> Scheduler<Boot> {
        info!(pid = std::process::id(), "Buckos init starting");

        self.host.set_env("PATH", PATH_STDPATH);
        self.host.set_env("SHELL", PATH_BSHELL);
        if let Err(e) = self.host.chdir(Path::new("/")) {
            warn!(error = %e, "Failed to change to /");
        }
        self.host.umask(0);

        if !self.state.rescue && !self.log.is_debug() {
            self.console.enable_progress();
        }

        emergency::spawn_watchdog();

        if let Err(e) = self.plugins.init() {
            error!(error = %e, "Failed to initialize plugins");
        }

        self.run_hooks(HookPoint::Banner);
        if !self.log.is_silent() {
            self.console.banner(INIT_HEADING);
        }

        self.host.ignore_signals();

        match self.host.cgroup_init() {
            Ok(true) => debug!("Control groups available"),
            Ok(false) => info!("Control groups not supported by kernel"),
            Err(e) => warn!(error = %e, "Failed to set up control groups"),
        }

        if self.state.rescue {
            info!("Rescue mode, skipping filesystem checks");
        } else {
            let (outcome, decision) =
                fsck::prepare_root(&self.fstab, &*self.probe, &self.interactive());
            debug!(?outcome, ?decision, "Root filesystem prepared");
        }

        self.run_hooks(HookPoint::RootfsUp);

        let code = self
            .interactive()
            .run(&["mount", "-na"], "Mounting local filesystems");
        if code != 0 {
            self.run_hooks(HookPoint::MountError);
        }
        self.run_hooks(HookPoint::MountPost);

        let code = self.interactive().run_quiet(&["swapon", "-ea"]);
        if code != 0 {
            warn!(code, "Failed to enable swap");
        }
        self.host.umask(0o022);

        self.config.init(&mut self.state, &mut *self.services);
        if let Some(name) = self.state.hostname.clone() {
            if let Err(e) = self.host.set_hostname(&name) {
                warn!(error = %e, hostname = %name, "Failed to set hostname");
            }
        }

        match self.conditions.init() {
            Ok(()) => {
                self.conditions_ready = true;
                for point in [HookPoint::Banner, HookPoint::RootfsUp] {
                    self.conditions.set_oneshot(point.cond_name());
                }
            }
            Err(e) => error!(error = %e, "Failed to initialize conditions"),
        }

        if let Err(e) = self.host.install_signals(self.events_tx.clone()) {
            error!(error = %e, "Failed to install signal handlers");
        }

        self.run_hooks(HookPoint::BasefsUp);

        if let Err(e) = self.config.monitor(self.events_tx.clone()) {
            warn!(error = %e, "Failed to watch configuration");
        }
        if let Err(e) = self.api.start(self.events_tx.clone()) {
            warn!(error = %e, "Failed to start control socket");
        }

        self.host.umask(0o022);

        let mut sched = Scheduler::new();
        sched.schedule(crank_work());
        sched.schedule(completion_work());
        sched
    }

    /// Leave bootstrap for the configured runlevel. Only the first call does anything.
    pub fn finalize(&mut self) {
        let Some(level) = self.state.commit_target() else {
            debug!("Bootstrap already finalized");
            return;
        };

        if !self.state.rescue {
            if let Some(dir) = self.state.runparts.clone() {
                if self.host.is_dir(&dir) {
                    let failed = exec::run_parts(&self.interactive(), &dir);
                    if failed > 0 {
                        warn!(failed, dir = %dir.display(), "Some run-parts scripts failed");
                    }
                }
            }
        }

        info!(runlevel = %level, "Change to default runlevel, start all services");
        self.services.runlevel(self.state.cfglevel);
        self.services.prune_bootstrap();

        self.run_hooks(HookPoint::SvcUp);
        self.services.step_all(ServiceFilter::Any);

        if !self.state.rescue && self.host.is_executable(&self.rc_local) {
            let rc_local = self.rc_local.display().to_string();
            let desc = format!("Calling {}", rc_local);
            self.interactive().run(&[rc_local.as_str()], &desc);
        }

        self.run_hooks(HookPoint::SystemUp);
        self.services.step_all(ServiceFilter::Any);

        self.log.silence();
        self.services.tty_runlevel();
    }

    /// Serve the main loop until a shutdown is requested.
    pub async fn run(&mut self, mut sched: Scheduler<Boot>) -> crate::Result<()> {
        let Some(mut events) = self.events_rx.take() else {
            warn!("Main loop already running");
            return Ok(());
        };

        info!("Init system ready, entering event loop");

        loop {
            let deadline = sched.next_deadline();
            tokio::select! {
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    sched.run_due(self);
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    if let Some(kind) = self.handle_event(event) {
                        self.shutdown(kind).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Bootstrap, then serve the main loop.
    pub async fn start(&mut self) -> crate::Result<()> {
        let sched = self.bootstrap();
        self.run(sched).await
    }

    /// Handle one event. Returns the shutdown it asks for, if any.
    fn handle_event(&mut self, event: Event) -> Option<ShutdownType> {
        match event {
            Event::Signal(InitSignal::Child) => {
                for status in self.host.reap() {
                    if !self.services.handle_exit(status.pid, status.code, status.signal) {
                        debug!(pid = status.pid, "Reaped unknown process");
                    }
                }
                self.services.step_all(ServiceFilter::Any);
                None
            }
            Event::Signal(InitSignal::Hangup) | Event::ConfigChanged => {
                info!("Reloading configuration");
                self.config.reload(&mut self.state, &mut *self.services);
                self.services.step_all(ServiceFilter::Any);
                None
            }
            Event::Signal(InitSignal::Reboot) => Some(ShutdownType::Reboot),
            Event::Signal(InitSignal::Halt) => Some(ShutdownType::Halt),
            Event::Signal(InitSignal::PowerOff) => Some(ShutdownType::PowerOff),
            Event::Control { command, reply } => {
                let (response, shutdown) = self.handle_control(command);
                if reply.send(response).is_err() {
                    debug!("Control client went away before the reply");
                }
                shutdown
            }
        }
    }

    /// Answer a control request.
    pub fn handle_control(
        &mut self,
        command: ControlCommand,
    ) -> (ControlResponse, Option<ShutdownType>) {
        let response = match command {
            ControlCommand::Ping => ControlResponse::Pong,
            ControlCommand::Status => ControlResponse::Status(self.status()),
            ControlCommand::ListServices => ControlResponse::ServiceList {
                services: self.services.statuses(),
            },
            ControlCommand::ListConditions => ControlResponse::Conditions {
                names: self.conditions.list(),
            },
            ControlCommand::Runlevel { level } => return self.change_runlevel(level),
        };
        (response, None)
    }

    fn status(&self) -> SystemStatus {
        SystemStatus {
            runlevel: self.state.runlevel.to_string(),
            prevlevel: self.state.prevlevel.map(|level| level.to_string()),
            cfglevel: self.state.cfglevel,
            bootstrapped: self.state.finalized(),
            rescue: self.state.rescue,
            single: self.state.single,
            hostname: self.state.hostname.clone(),
        }
    }

    fn change_runlevel(&mut self, level: u8) -> (ControlResponse, Option<ShutdownType>) {
        if !self.state.finalized() {
            return (
                ControlResponse::Error {
                    message: "Bootstrap still in progress".to_string(),
                },
                None,
            );
        }

        match level {
            0 => (
                ControlResponse::Success {
                    message: "Powering off".to_string(),
                },
                Some(ShutdownType::PowerOff),
            ),
            6 => (
                ControlResponse::Success {
                    message: "Rebooting".to_string(),
                },
                Some(ShutdownType::Reboot),
            ),
            _ => match Runlevel::checked(level) {
                Ok(target) => {
                    info!(runlevel = %target, "Changing runlevel");
                    self.state.enter(target);
                    self.services.runlevel(level);
                    self.services.step_all(ServiceFilter::Any);
                    (
                        ControlResponse::Success {
                            message: format!("Runlevel {}", target),
                        },
                        None,
                    )
                }
                Err(e) => (
                    ControlResponse::Error {
                        message: e.to_string(),
                    },
                    None,
                ),
            },
        }
    }

    async fn shutdown(&mut self, kind: ShutdownType) {
        info!(shutdown_type = ?kind, "Initiating system shutdown");

        self.services.stop_all();
        sleep(SHUTDOWN_GRACE).await;
        for status in self.host.reap() {
            self.services.handle_exit(status.pid, status.code, status.signal);
        }

        if let Err(e) = self.host.shutdown(kind) {
            error!(error = %e, "Failed to shut down");
        }
    }
}

/// Start the service state machine and give it its first step.
fn crank_work() -> WorkItem<Boot> {
    WorkItem::new("crank", |boot: &mut Boot| {
        boot.services.sm_init();
        boot.services.sm_step();
        WorkOutcome::Done
    })
}

/// Poll for bootstrap completion once a second, finalizing when the gate opens.
fn completion_work() -> WorkItem<Boot> {
    let mut gate = CompletionGate::default();
    WorkItem::new("final", move |boot: &mut Boot| {
        boot.services.step_all(ServiceFilter::Any);
        match gate.tick(boot.services.completed()) {
            GateVerdict::Wait { remaining } => {
                debug!(remaining, "Not all bootstrap run/tasks have completed yet");
                WorkOutcome::RetryAfter(GATE_INTERVAL)
            }
            GateVerdict::Completed { tick } => {
                info!(tick, "All run/task have completed, resuming bootstrap");
                boot.completion = Some(Completion::AllCompleted { tick });
                boot.finalize();
                WorkOutcome::Done
            }
            GateVerdict::TimedOut { tick } => {
                warn!(tick, "Timeout waiting for bootstrap run/tasks, resuming bootstrap");
                boot.completion = Some(Completion::TimedOut { tick });
                boot.finalize();
                WorkOutcome::Done
            }
            GateVerdict::Spent => WorkOutcome::Done,
        }
    })
    .with_delay(GATE_INTERVAL)
}
