//! Static configuration and the service snippet directory.
//!
//! `/etc/buckos/init.toml` holds global settings and may declare services
//! inline. Every `*.toml` file in the snippet directory declares more.
//!
//! ```toml
//! runlevel = 3
//! hostname = "buckos"
//! runparts = "/etc/buckos/start.d"
//!
//! [[service]]
//! name = "syslogd"
//! exec = "/sbin/syslogd -n"
//! runlevels = "S12345"
//! ```

use crate::error::{Error, Result};
use crate::events::{Event, EventSender};
use crate::service::{ServiceDefinition, ServiceLayer};
use crate::state::{BootState, DEFAULT_RUNLEVEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Default static configuration file.
pub const DEFAULT_CONFIG: &str = "/etc/buckos/init.toml";

/// How often the snippet directory is checked for changes.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Contents of the static configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Default runlevel after bootstrap
    pub runlevel: Option<u8>,
    /// Hostname to set
    pub hostname: Option<String>,
    /// Network configuration path
    pub network: Option<PathBuf>,
    /// Scripts run once bootstrap completes
    pub runparts: Option<PathBuf>,
    /// Snippet directory
    pub rcsd: Option<PathBuf>,
    /// Services declared inline
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDefinition>,
}

impl InitConfig {
    /// Parse the config file. A runlevel that cannot be a default is
    /// dropped on its own; the rest of the file still applies.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: InitConfig = toml::from_str(content)?;
        if let Some(level) = config.runlevel {
            if !(1..=9).contains(&level) || level == 6 {
                warn!(runlevel = level, "Runlevel cannot be a default, ignoring");
                config.runlevel = None;
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Snippet {
    #[serde(default, rename = "service")]
    services: Vec<ServiceDefinition>,
}

/// Load every `*.toml` snippet in `dir`, in name order. Broken files are
/// logged and skipped.
pub fn load_snippets(dir: &Path) -> Vec<ServiceDefinition> {
    let mut defs = Vec::new();

    for path in snippet_files(dir) {
        let loaded = std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|content| toml::from_str::<Snippet>(&content).map_err(Error::from));

        match loaded {
            Ok(snippet) => {
                debug!(path = %path.display(), services = snippet.services.len(), "Loaded snippet");
                defs.extend(snippet.services);
            }
            Err(e) => error!(path = %path.display(), error = %e, "Failed to load snippet"),
        }
    }

    defs
}

fn snippet_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("toml"))
        .collect();
    files.sort();
    files
}

/// Modification times of every snippet, used to notice edits.
fn fingerprint(dir: &Path) -> BTreeMap<PathBuf, Option<SystemTime>> {
    snippet_files(dir)
        .into_iter()
        .map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            (path, modified)
        })
        .collect()
}

/// The configuration loader as the sequencer sees it.
pub trait ConfigSource {
    /// Load the static file and snippets into `state` and `services`.
    fn init(&mut self, state: &mut BootState, services: &mut dyn ServiceLayer);

    /// Start watching the snippet directory, posting `Event::ConfigChanged`.
    fn monitor(&mut self, events: EventSender) -> Result<()>;

    /// Pick up snippets added since the last load.
    fn reload(&mut self, state: &mut BootState, services: &mut dyn ServiceLayer);
}

/// Loads configuration from disk.
#[derive(Debug, Clone)]
pub struct ConfLoader {
    path: PathBuf,
    rcsd: Option<PathBuf>,
}

impl ConfLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rcsd: None,
        }
    }

    /// Snippet directory, known once `init` ran.
    pub fn rcsd(&self) -> Option<&Path> {
        self.rcsd.as_deref()
    }

    fn register_all(services: &mut dyn ServiceLayer, defs: Vec<ServiceDefinition>) -> usize {
        let mut added = 0;
        for def in defs {
            let name = def.name.clone();
            match services.register(def) {
                Ok(()) => added += 1,
                Err(Error::ServiceAlreadyExists(_)) => debug!(service = %name, "Already registered"),
                Err(e) => warn!(service = %name, error = %e, "Failed to register service"),
            }
        }
        added
    }
}

impl Default for ConfLoader {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG)
    }
}

impl ConfigSource for ConfLoader {
    fn init(&mut self, state: &mut BootState, services: &mut dyn ServiceLayer) {
        let config = if self.path.exists() {
            match InitConfig::from_file(&self.path) {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Failed to load config, using defaults");
                    InitConfig::default()
                }
            }
        } else {
            info!(path = %self.path.display(), "No config file, using defaults");
            InitConfig::default()
        };

        state.set_configured_level(config.runlevel.unwrap_or(DEFAULT_RUNLEVEL));
        state.hostname = config.hostname;
        state.network = config.network;
        state.runparts = config.runparts;
        if let Some(rcsd) = config.rcsd {
            state.rcsd = rcsd;
        }
        self.rcsd = Some(state.rcsd.clone());

        let mut added = Self::register_all(services, config.services);
        added += Self::register_all(services, load_snippets(&state.rcsd));
        info!(services = added, runlevel = state.cfglevel, "Configuration loaded");
    }

    fn monitor(&mut self, events: EventSender) -> Result<()> {
        let dir = self
            .rcsd
            .clone()
            .ok_or_else(|| Error::Config("monitor started before configuration was loaded".into()))?;

        info!(dir = %dir.display(), "Watching for service changes");
        tokio::spawn(async move {
            let mut last = fingerprint(&dir);
            let mut interval = tokio::time::interval(MONITOR_INTERVAL);

            loop {
                interval.tick().await;
                let current = fingerprint(&dir);
                if current != last {
                    last = current;
                    debug!(dir = %dir.display(), "Service snippets changed");
                    if events.send(Event::ConfigChanged).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    fn reload(&mut self, state: &mut BootState, services: &mut dyn ServiceLayer) {
        let added = Self::register_all(services, load_snippets(&state.rcsd));
        info!(services = added, "Configuration reloaded");
    }
}
