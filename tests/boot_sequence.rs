//! Tests for the boot sequence, driven through recording collaborators

use buckos_init::boot::Collaborators;
use buckos_init::control::{ControlCommand, ControlResponse};
use buckos_init::{
    ApiResponder, Boot, BootParams, BootState, CommandRunner, Completion, Conditions,
    ConfigSource, Event, EventSender, ExitStatus, FsProbe, HookPoint, Host, InitSignal,
    LogControl, LogLevel, Plugins, Runlevel, ServiceDefinition, ServiceFilter, ServiceLayer,
    ServiceStatus, ShutdownType,
};
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Journal = Rc<RefCell<Vec<String>>>;

fn note(journal: &Journal, entry: impl Into<String>) {
    journal.borrow_mut().push(entry.into());
}

struct FakeHost {
    journal: Journal,
    dirs: Vec<PathBuf>,
    executables: Vec<PathBuf>,
    exits: Rc<RefCell<Vec<ExitStatus>>>,
}

impl Host for FakeHost {
    fn set_env(&mut self, key: &str, value: &str) {
        note(&self.journal, format!("env {}={}", key, value));
    }

    fn chdir(&mut self, dir: &Path) -> buckos_init::Result<()> {
        note(&self.journal, format!("chdir {}", dir.display()));
        Ok(())
    }

    fn umask(&mut self, mask: u32) {
        note(&self.journal, format!("umask {:o}", mask));
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.iter().any(|dir| dir == path)
    }

    fn is_executable(&self, path: &Path) -> bool {
        self.executables.iter().any(|exe| exe == path)
    }

    fn set_hostname(&mut self, name: &str) -> buckos_init::Result<()> {
        note(&self.journal, format!("hostname {}", name));
        Ok(())
    }

    fn ignore_signals(&mut self) {
        note(&self.journal, "ignore_signals");
    }

    fn install_signals(&mut self, _events: EventSender) -> buckos_init::Result<()> {
        note(&self.journal, "install_signals");
        Ok(())
    }

    fn cgroup_init(&mut self) -> buckos_init::Result<bool> {
        note(&self.journal, "cgroup_init");
        Ok(false)
    }

    fn reap(&mut self) -> Vec<ExitStatus> {
        self.exits.borrow_mut().drain(..).collect()
    }

    fn shutdown(&mut self, kind: ShutdownType) -> buckos_init::Result<()> {
        note(&self.journal, format!("shutdown {:?}", kind));
        Ok(())
    }
}

struct FakeRunner {
    journal: Journal,
    failing: Vec<&'static str>,
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[&str], _env: &[(&str, &str)]) -> i32 {
        let line = argv.join(" ");
        note(&self.journal, format!("run {}", line));
        if self.failing.iter().any(|cmd| *cmd == line) {
            8
        } else {
            0
        }
    }
}

struct EveryDevice;

impl FsProbe for EveryDevice {
    fn is_block_device(&self, _spec: &str) -> bool {
        true
    }

    fn is_mounted_rw(&self, _mountpoint: &str) -> bool {
        false
    }
}

struct FakePlugins {
    journal: Journal,
}

impl Plugins for FakePlugins {
    fn init(&mut self) -> buckos_init::Result<()> {
        note(&self.journal, "plugins:init");
        Ok(())
    }

    fn run_hooks(&mut self, point: HookPoint) {
        note(&self.journal, format!("hook {}", point.cond_name()));
    }
}

struct FakeServices {
    journal: Journal,
    steps: u32,
    complete_at: Option<u32>,
}

impl ServiceLayer for FakeServices {
    fn register(&mut self, _def: ServiceDefinition) -> buckos_init::Result<()> {
        Ok(())
    }

    fn sm_init(&mut self) {
        note(&self.journal, "sm_init");
    }

    fn sm_step(&mut self) {
        note(&self.journal, "sm_step");
    }

    fn runlevel(&mut self, level: u8) {
        note(&self.journal, format!("runlevel {}", level));
    }

    fn step_all(&mut self, _filter: ServiceFilter) {
        self.steps += 1;
        note(&self.journal, "step_all");
    }

    fn completed(&self) -> bool {
        self.complete_at.map_or(false, |tick| self.steps >= tick)
    }

    fn prune_bootstrap(&mut self) {
        note(&self.journal, "prune");
    }

    fn tty_runlevel(&mut self) {
        note(&self.journal, "tty");
    }

    fn handle_exit(&mut self, pid: u32, _code: Option<i32>, _signal: Option<i32>) -> bool {
        note(&self.journal, format!("exit {}", pid));
        true
    }

    fn statuses(&self) -> Vec<ServiceStatus> {
        Vec::new()
    }

    fn stop_all(&mut self) {
        note(&self.journal, "stop_all");
    }
}

struct FakeConditions {
    journal: Journal,
    set: Vec<String>,
}

impl Conditions for FakeConditions {
    fn init(&mut self) -> buckos_init::Result<()> {
        note(&self.journal, "cond:init");
        Ok(())
    }

    fn set_oneshot(&mut self, name: &str) {
        note(&self.journal, format!("cond {}", name));
        self.set.push(name.to_string());
    }

    fn is_set(&self, name: &str) -> bool {
        self.set.iter().any(|set| set == name)
    }

    fn list(&self) -> Vec<String> {
        self.set.clone()
    }
}

struct FakeConfig {
    journal: Journal,
    level: Option<u8>,
    runparts: Option<PathBuf>,
}

impl ConfigSource for FakeConfig {
    fn init(&mut self, state: &mut BootState, _services: &mut dyn ServiceLayer) {
        note(&self.journal, "conf:init");
        if let Some(level) = self.level {
            state.set_configured_level(level);
        }
        state.runparts = self.runparts.clone();
        state.hostname = Some("testbox".to_string());
    }

    fn monitor(&mut self, _events: EventSender) -> buckos_init::Result<()> {
        note(&self.journal, "conf:monitor");
        Ok(())
    }

    fn reload(&mut self, _state: &mut BootState, _services: &mut dyn ServiceLayer) {
        note(&self.journal, "conf:reload");
    }
}

struct FakeApi {
    journal: Journal,
}

impl ApiResponder for FakeApi {
    fn start(&mut self, _events: EventSender) -> buckos_init::Result<()> {
        note(&self.journal, "api:start");
        Ok(())
    }
}

const RC_LOCAL: &str = "/etc/rc.local.test";

/// Knobs for one test boot
#[derive(Default)]
struct Rig {
    params: Vec<&'static str>,
    failing: Vec<&'static str>,
    complete_at: Option<u32>,
    level: Option<u8>,
    runparts: Option<PathBuf>,
    rc_local: bool,
    fstab: Option<PathBuf>,
}

/// A booted system plus what it did
struct Booted {
    boot: Boot,
    journal: Journal,
    exits: Rc<RefCell<Vec<ExitStatus>>>,
}

impl Rig {
    fn build(self) -> Booted {
        let journal: Journal = Rc::new(RefCell::new(Vec::new()));
        let exits = Rc::new(RefCell::new(Vec::new()));
        let params = BootParams::parse(self.params);

        let parts = Collaborators {
            host: Box::new(FakeHost {
                journal: Rc::clone(&journal),
                dirs: self.runparts.iter().cloned().collect(),
                executables: if self.rc_local {
                    vec![PathBuf::from(RC_LOCAL)]
                } else {
                    Vec::new()
                },
                exits: Rc::clone(&exits),
            }),
            runner: Rc::new(FakeRunner {
                journal: Rc::clone(&journal),
                failing: self.failing,
            }),
            probe: Box::new(EveryDevice),
            plugins: Box::new(FakePlugins {
                journal: Rc::clone(&journal),
            }),
            services: Box::new(FakeServices {
                journal: Rc::clone(&journal),
                steps: 0,
                complete_at: self.complete_at,
            }),
            conditions: Box::new(FakeConditions {
                journal: Rc::clone(&journal),
                set: Vec::new(),
            }),
            config: Box::new(FakeConfig {
                journal: Rc::clone(&journal),
                level: self.level,
                runparts: self.runparts,
            }),
            api: Box::new(FakeApi {
                journal: Rc::clone(&journal),
            }),
        };

        let log = LogControl::detached(LogLevel::from_params(&params));
        let boot = Boot::new(&params, log, parts)
            .with_fstab(
                self.fstab
                    .unwrap_or_else(|| PathBuf::from("/nonexistent/buckos/fstab")),
            )
            .with_rc_local(RC_LOCAL);

        Booted {
            boot,
            journal,
            exits,
        }
    }
}

impl Booted {
    fn entries(&self) -> Vec<String> {
        self.journal.borrow().clone()
    }

    fn pos(&self, entry: &str) -> usize {
        self.journal
            .borrow()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{:?} never happened: {:?}", entry, self.entries()))
    }

    fn count(&self, entry: &str) -> usize {
        self.journal.borrow().iter().filter(|e| *e == entry).count()
    }

    fn has(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    fn hooks(&self) -> Vec<String> {
        self.journal
            .borrow()
            .iter()
            .filter_map(|e| e.strip_prefix("hook ").map(str::to_string))
            .collect()
    }

    fn assert_order(&self, entries: &[&str]) {
        let positions: Vec<usize> = entries.iter().map(|e| self.pos(e)).collect();
        for (pair, window) in entries.windows(2).zip(positions.windows(2)) {
            assert!(
                window[0] < window[1],
                "{:?} should come before {:?}: {:?}",
                pair[0],
                pair[1],
                self.entries()
            );
        }
    }

    async fn boot_to_runlevel(&mut self) {
        let mut sched = self.boot.bootstrap();
        sched.run_until_idle(&mut self.boot).await;
    }
}

fn script(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fstab(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("fstab");
    fs::write(&path, content).unwrap();
    path
}

const TWO_PASS_FSTAB: &str = "\
/dev/sda1  /     ext4  defaults  0 1
/dev/sda2  /var  ext4  defaults  0 2
proc       /proc proc  defaults  0 0
";

mod stages {
    use super::*;

    #[test]
    fn test_bootstrap_stage_order() {
        let mut booted = Rig::default().build();
        let _sched = booted.boot.bootstrap();

        booted.assert_order(&[
            "env PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            "env SHELL=/bin/sh",
            "chdir /",
            "umask 0",
            "plugins:init",
            "hook hook/banner",
            "ignore_signals",
            "cgroup_init",
            "hook hook/rootfs/up",
            "run mount -na",
            "hook hook/mount/post",
            "run swapon -ea",
            "umask 22",
            "conf:init",
            "hostname testbox",
            "cond:init",
            "install_signals",
            "hook hook/basefs/up",
            "conf:monitor",
            "api:start",
        ]);
        assert_eq!(booted.count("umask 22"), 2);
    }

    #[test]
    fn test_service_work_is_deferred() {
        let mut booted = Rig::default().build();
        let sched = booted.boot.bootstrap();

        assert_eq!(sched.len(), 2);
        assert!(!booted.has("sm_init"));
        assert!(!booted.has("hook hook/svc/up"));
        assert!(!booted.boot.state().finalized());
        assert_eq!(booted.boot.state().runlevel, Runlevel::Bootstrap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_fire_in_order() {
        let mut booted = Rig {
            complete_at: Some(1),
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        assert_eq!(
            booted.hooks(),
            vec![
                "hook/banner",
                "hook/rootfs/up",
                "hook/mount/post",
                "hook/basefs/up",
                "hook/svc/up",
                "hook/system/up",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_failure_fires_mount_error() {
        let mut booted = Rig {
            complete_at: Some(1),
            failing: vec!["mount -na"],
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        assert_eq!(
            booted.hooks(),
            vec![
                "hook/banner",
                "hook/rootfs/up",
                "hook/mount/error",
                "hook/mount/post",
                "hook/basefs/up",
                "hook/svc/up",
                "hook/system/up",
            ]
        );
    }

    #[test]
    fn test_early_hooks_recorded_retroactively() {
        let mut booted = Rig::default().build();
        let _sched = booted.boot.bootstrap();

        booted.assert_order(&[
            "hook hook/banner",
            "hook hook/rootfs/up",
            "cond:init",
            "cond hook/banner",
            "cond hook/rootfs/up",
            "hook hook/basefs/up",
            "cond hook/basefs/up",
        ]);
        assert_eq!(booted.count("cond hook/banner"), 1);
        assert_eq!(booted.count("cond hook/rootfs/up"), 1);
        assert!(!booted.has("cond hook/mount/post"));
    }

    #[test]
    fn test_single_user_overrides_config_level() {
        let mut booted = Rig {
            params: vec!["single"],
            level: Some(3),
            ..Default::default()
        }
        .build();
        let _sched = booted.boot.bootstrap();
        booted.boot.finalize();

        assert!(booted.has("runlevel 1"));
        assert_eq!(booted.boot.state().runlevel, Runlevel::Level(1));
    }

    #[test]
    fn test_config_level_used_without_override() {
        let mut booted = Rig {
            level: Some(3),
            ..Default::default()
        }
        .build();
        let _sched = booted.boot.bootstrap();
        booted.boot.finalize();

        assert!(booted.has("runlevel 3"));
        assert_eq!(booted.boot.state().target(), Some(Runlevel::Level(3)));
    }
}

mod filesystems {
    use super::*;

    #[test]
    fn test_clean_checks_remount_root() {
        let temp = TempDir::new().unwrap();
        let mut booted = Rig {
            fstab: Some(fstab(temp.path(), TWO_PASS_FSTAB)),
            ..Default::default()
        }
        .build();
        let _sched = booted.boot.bootstrap();

        booted.assert_order(&[
            "run fsck -a /dev/sda1",
            "run fsck -a /dev/sda2",
            "run mount -n -o remount,rw /",
            "hook hook/rootfs/up",
        ]);
        assert!(!booted.has("run fsck -a proc"));
    }

    #[test]
    fn test_failed_pass_blocks_later_passes_and_remount() {
        let temp = TempDir::new().unwrap();
        let mut booted = Rig {
            fstab: Some(fstab(temp.path(), TWO_PASS_FSTAB)),
            failing: vec!["fsck -a /dev/sda1"],
            ..Default::default()
        }
        .build();
        let _sched = booted.boot.bootstrap();

        assert!(booted.has("run fsck -a /dev/sda1"));
        assert!(!booted.has("run fsck -a /dev/sda2"));
        assert!(!booted.has("run mount -n -o remount,rw /"));
        booted.assert_order(&["run fsck -a /dev/sda1", "hook hook/rootfs/up"]);
    }

    #[test]
    fn test_read_only_root_not_remounted() {
        let temp = TempDir::new().unwrap();
        let mut booted = Rig {
            fstab: Some(fstab(temp.path(), "/dev/sda1 / ext4 ro,noatime 0 1\n")),
            ..Default::default()
        }
        .build();
        let _sched = booted.boot.bootstrap();

        assert!(booted.has("run fsck -a /dev/sda1"));
        assert!(!booted.has("run mount -n -o remount,rw /"));
    }

    #[test]
    fn test_unreadable_fstab_skips_remount() {
        let mut booted = Rig::default().build();
        let _sched = booted.boot.bootstrap();

        assert!(!booted.entries().iter().any(|e| e.starts_with("run fsck")));
        assert!(!booted.has("run mount -n -o remount,rw /"));
        assert!(booted.has("hook hook/rootfs/up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescue_skips_checks_and_scripts() {
        let temp = TempDir::new().unwrap();
        let parts = temp.path().join("runparts");
        fs::create_dir(&parts).unwrap();
        script(&parts, "10-hello");

        let mut booted = Rig {
            params: vec!["rescue"],
            complete_at: Some(1),
            fstab: Some(fstab(temp.path(), TWO_PASS_FSTAB)),
            runparts: Some(parts),
            rc_local: true,
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        assert!(!booted.boot.console().progress_enabled());
        assert!(!booted.entries().iter().any(|e| e.starts_with("run fsck")));
        assert!(!booted.has("run mount -n -o remount,rw /"));
        assert!(!booted.entries().iter().any(|e| e.contains("10-hello")));
        assert!(!booted.has(&format!("run {}", RC_LOCAL)));
        assert!(booted.has("hook hook/system/up"));
    }
}

mod completion {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_finalize_on_tick_of_completion() {
        let mut booted = Rig {
            complete_at: Some(45),
            ..Default::default()
        }
        .build();

        let start = Instant::now();
        booted.boot_to_runlevel().await;
        let elapsed = start.elapsed();

        assert_eq!(
            booted.boot.completion(),
            Some(Completion::AllCompleted { tick: 45 })
        );
        assert!(elapsed >= Duration::from_secs(45), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(46), "{:?}", elapsed);
        assert_eq!(booted.count("runlevel 2"), 1);
        assert_eq!(booted.boot.state().runlevel, Runlevel::Level(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_after_gate_times_out() {
        let mut booted = Rig::default().build();

        let start = Instant::now();
        booted.boot_to_runlevel().await;
        let elapsed = start.elapsed();

        assert_eq!(
            booted.boot.completion(),
            Some(Completion::TimedOut { tick: 120 })
        );
        assert!(elapsed >= Duration::from_secs(120), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(121), "{:?}", elapsed);
        assert_eq!(booted.count("runlevel 2"), 1);
        assert!(booted.boot.state().finalized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crank_runs_before_first_check() {
        let mut booted = Rig {
            complete_at: Some(1),
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        booted.assert_order(&["api:start", "sm_init", "sm_step", "step_all", "runlevel 2"]);
        assert_eq!(booted.count("sm_init"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_runs_once() {
        let mut booted = Rig {
            complete_at: Some(2),
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;
        booted.boot.finalize();
        booted.boot.finalize();

        assert_eq!(booted.count("runlevel 2"), 1);
        assert_eq!(booted.count("prune"), 1);
        assert_eq!(booted.count("hook hook/svc/up"), 1);
        assert_eq!(booted.count("hook hook/system/up"), 1);
        assert_eq!(booted.count("tty"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_order() {
        let temp = TempDir::new().unwrap();
        let parts = temp.path().join("runparts");
        fs::create_dir(&parts).unwrap();
        let hello = script(&parts, "10-hello");

        let mut booted = Rig {
            complete_at: Some(1),
            runparts: Some(parts),
            rc_local: true,
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        let hello = format!("run {} start", hello.display());
        let rc_local = format!("run {}", RC_LOCAL);
        booted.assert_order(&[
            hello.as_str(),
            "runlevel 2",
            "prune",
            "hook hook/svc/up",
            rc_local.as_str(),
            "hook hook/system/up",
            "tty",
        ]);
        assert!(booted.boot.log().is_silent());
    }
}

mod main_loop {
    use super::*;

    async fn ask(tx: &EventSender, command: ControlCommand) -> ControlResponse {
        let (reply, response) = oneshot::channel();
        tx.send(Event::Control { command, reply }).unwrap();
        response.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_events_until_shutdown() {
        let mut booted = Rig {
            complete_at: Some(1),
            ..Default::default()
        }
        .build();
        let sched = booted.boot.bootstrap();
        let tx = booted.boot.event_sender();
        booted.exits.borrow_mut().push(ExitStatus {
            pid: 42,
            code: Some(0),
            signal: None,
        });

        let driver = async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send(Event::Signal(InitSignal::Child)).unwrap();
            tx.send(Event::Signal(InitSignal::Hangup)).unwrap();
            let status = ask(&tx, ControlCommand::Status).await;
            let changed = ask(&tx, ControlCommand::Runlevel { level: 3 }).await;
            let conditions = ask(&tx, ControlCommand::ListConditions).await;
            tx.send(Event::Signal(InitSignal::Reboot)).unwrap();
            (status, changed, conditions)
        };

        let (result, (status, changed, conditions)) =
            tokio::join!(booted.boot.run(sched), driver);
        assert!(result.is_ok());

        match status {
            ControlResponse::Status(status) => {
                assert!(status.bootstrapped);
                assert_eq!(status.runlevel, "2");
                assert_eq!(status.prevlevel.as_deref(), Some("S"));
                assert_eq!(status.hostname.as_deref(), Some("testbox"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(matches!(changed, ControlResponse::Success { .. }));
        match conditions {
            ControlResponse::Conditions { names } => {
                assert!(names.contains(&"hook/system/up".to_string()));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        booted.assert_order(&[
            "tty",
            "exit 42",
            "conf:reload",
            "runlevel 3",
            "stop_all",
            "shutdown Reboot",
        ]);
        assert_eq!(booted.boot.state().runlevel, Runlevel::Level(3));
        assert_eq!(booted.boot.state().prevlevel, Some(Runlevel::Level(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runlevel_zero_powers_off() {
        let mut booted = Rig {
            complete_at: Some(1),
            ..Default::default()
        }
        .build();
        let sched = booted.boot.bootstrap();
        let tx = booted.boot.event_sender();

        let driver = async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ask(&tx, ControlCommand::Runlevel { level: 0 }).await
        };

        let (result, response) = tokio::join!(booted.boot.run(sched), driver);
        assert!(result.is_ok());
        assert!(matches!(response, ControlResponse::Success { .. }));
        assert!(booted.has("shutdown PowerOff"));
    }

    #[test]
    fn test_runlevel_refused_during_bootstrap() {
        let mut booted = Rig::default().build();
        let _sched = booted.boot.bootstrap();

        let (response, shutdown) = booted
            .boot
            .handle_control(ControlCommand::Runlevel { level: 3 });

        assert!(matches!(response, ControlResponse::Error { .. }));
        assert!(shutdown.is_none());
        assert!(!booted.has("runlevel 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_runlevel_rejected() {
        let mut booted = Rig {
            complete_at: Some(1),
            ..Default::default()
        }
        .build();
        booted.boot_to_runlevel().await;

        let (response, shutdown) = booted
            .boot
            .handle_control(ControlCommand::Runlevel { level: 12 });

        assert!(matches!(response, ControlResponse::Error { .. }));
        assert!(shutdown.is_none());
        assert_eq!(booted.boot.state().runlevel, Runlevel::Level(2));
    }
}
