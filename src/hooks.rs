//! Hook points: fixed rendezvous in the boot sequence.
//!
//! Handlers registered at a point run synchronously, in registration
//! order, before the sequencer moves on. A failing handler is logged and
//! the next one runs.

use crate::error::Result;
use crate::exec::{executables_in, CommandRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Default directory holding one sub-directory of hook scripts per point.
pub const DEFAULT_HOOKS_DIR: &str = "/etc/buckos/hooks";

/// Where in the boot sequence a hook runs, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    /// Before the banner is printed
    Banner,
    /// Root filesystem checked and remounted
    RootfsUp,
    /// `mount -a` failed
    MountError,
    /// After `mount -a`, whatever its outcome
    MountPost,
    /// Configuration loaded, conditions and signals ready
    BasefsUp,
    /// Every service of the default runlevel has been started
    SvcUp,
    /// Bootstrap is over
    SystemUp,
}

impl HookPoint {
    pub const ALL: [HookPoint; 7] = [
        HookPoint::Banner,
        HookPoint::RootfsUp,
        HookPoint::MountError,
        HookPoint::MountPost,
        HookPoint::BasefsUp,
        HookPoint::SvcUp,
        HookPoint::SystemUp,
    ];

    /// Name of the condition recorded when this hook has run.
    pub fn cond_name(self) -> &'static str {
        match self {
            HookPoint::Banner => "hook/banner",
            HookPoint::RootfsUp => "hook/rootfs/up",
            HookPoint::MountError => "hook/mount/error",
            HookPoint::MountPost => "hook/mount/post",
            HookPoint::BasefsUp => "hook/basefs/up",
            HookPoint::SvcUp => "hook/svc/up",
            HookPoint::SystemUp => "hook/system/up",
        }
    }

    /// Directory name for this point's hook scripts.
    pub fn slug(self) -> &'static str {
        match self {
            HookPoint::Banner => "banner",
            HookPoint::RootfsUp => "rootfs-up",
            HookPoint::MountError => "mount-error",
            HookPoint::MountPost => "mount-post",
            HookPoint::BasefsUp => "basefs-up",
            HookPoint::SvcUp => "svc-up",
            HookPoint::SystemUp => "system-up",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cond_name())
    }
}

/// The plugin subsystem as the sequencer sees it.
pub trait Plugins {
    /// Load plugins. Must run before the first hook fires.
    fn init(&mut self) -> Result<()>;

    /// Run every handler registered at `point`.
    fn run_hooks(&mut self, point: HookPoint);
}

/// A hook handler. Errors are logged by the registry, never propagated.
pub type HookFn = Box<dyn FnMut(HookPoint) -> anyhow::Result<()>>;

struct Handler {
    point: HookPoint,
    name: String,
    run: HookFn,
}

/// In-process hook registry, plus executable scripts picked up from disk.
pub struct HookRegistry {
    handlers: Vec<Handler>,
    scripts_dir: Option<PathBuf>,
    runner: Rc<dyn CommandRunner>,
}

impl HookRegistry {
    /// A registry that also loads scripts from `scripts_dir/<point>/` on init.
    pub fn new(scripts_dir: Option<PathBuf>, runner: Rc<dyn CommandRunner>) -> Self {
        Self {
            handlers: Vec::new(),
            scripts_dir,
            runner,
        }
    }

    /// Register a handler at `point`.
    pub fn register(
        &mut self,
        point: HookPoint,
        name: impl Into<String>,
        run: impl FnMut(HookPoint) -> anyhow::Result<()> + 'static,
    ) {
        let name = name.into();
        debug!(hook = %point, handler = %name, "Registered hook handler");
        self.handlers.push(Handler {
            point,
            name,
            run: Box::new(run),
        });
    }

    /// Number of handlers registered at `point`.
    pub fn count(&self, point: HookPoint) -> usize {
        self.handlers.iter().filter(|h| h.point == point).count()
    }

    fn load_scripts(&mut self) {
        let Some(dir) = self.scripts_dir.clone() else {
            return;
        };

        for point in HookPoint::ALL {
            for script in executables_in(&dir.join(point.slug())) {
                let runner = Rc::clone(&self.runner);
                let path = script.to_string_lossy().into_owned();
                let name = path.clone();

                self.register(point, name, move |point| {
                    let code = runner.run(&[path.as_str()], &[("HOOK", point.cond_name())]);
                    if code == 0 {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("{} exited with code {}", path, code))
                    }
                });
            }
        }
    }
}

impl Plugins for HookRegistry {
    fn init(&mut self) -> Result<()> {
        self.load_scripts();
        info!(handlers = self.handlers.len(), "Plugin hooks loaded");
        Ok(())
    }

    fn run_hooks(&mut self, point: HookPoint) {
        for handler in self.handlers.iter_mut().filter(|h| h.point == point) {
            debug!(hook = %point, handler = %handler.name, "Running hook");
            if let Err(e) = (handler.run)(point) {
                warn!(hook = %point, handler = %handler.name, error = %e, "Hook failed");
            }
        }
    }
}
