//! Global boot state, owned by the boot sequencer.

use crate::cmdline::BootParams;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Runlevel used when neither the config nor the kernel names one.
pub const DEFAULT_RUNLEVEL: u8 = 2;

/// Default directory for `*.toml` service snippets.
pub const DEFAULT_RCSD: &str = "/etc/buckos/init.d";

/// An execution level. `Bootstrap` is the pseudo level `S` the system
/// sits in until finalize commits to the configured level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runlevel {
    Bootstrap,
    Level(u8),
}

impl Runlevel {
    /// Parse a single runlevel character: `S`, or `0`-`9`.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'S' | 's' => Some(Runlevel::Bootstrap),
            '0'..='9' => c.to_digit(10).map(|d| Runlevel::Level(d as u8)),
            _ => None,
        }
    }

    /// Validate a level an operator may switch to.
    pub fn checked(level: u8) -> Result<Self> {
        if level > 9 {
            return Err(Error::InvalidRunlevel(level.to_string()));
        }
        Ok(Runlevel::Level(level))
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runlevel::Bootstrap => write!(f, "S"),
            Runlevel::Level(n) => write!(f, "{}", n),
        }
    }
}

/// Process-lifetime boot state.
///
/// Created once in `main`, mutated by the sequencer during bootstrap and by
/// runlevel changes afterwards. Lives on the main thread only.
#[derive(Debug, Clone)]
pub struct BootState {
    /// Current runlevel
    pub runlevel: Runlevel,
    /// Previous runlevel, if any transition happened yet
    pub prevlevel: Option<Runlevel>,
    /// Level committed to by finalize; written exactly once
    target: Option<Runlevel>,
    /// Configured default level (config file, then kernel override)
    pub cfglevel: u8,
    /// Rescue mode: skip fsck and operator scripts
    pub rescue: bool,
    /// Single-user mode
    pub single: bool,
    /// Splash and progress enabled
    pub splash: bool,
    /// Debug logging requested on the kernel command line
    pub debug: bool,
    /// Network configuration path from the static config
    pub network: Option<PathBuf>,
    /// Hostname from the static config
    pub hostname: Option<String>,
    /// Directory of service snippets
    pub rcsd: PathBuf,
    /// Post-bootstrap script directory
    pub runparts: Option<PathBuf>,
    /// Runlevel forced on the kernel command line
    cmdline_level: Option<u8>,
}

impl BootState {
    /// Seed the state from kernel boot parameters.
    pub fn new(params: &BootParams) -> Self {
        let mut state = Self {
            runlevel: Runlevel::Bootstrap,
            prevlevel: None,
            target: None,
            cfglevel: DEFAULT_RUNLEVEL,
            rescue: params.rescue,
            single: params.single,
            splash: params.splash,
            debug: params.debug,
            network: None,
            hostname: None,
            rcsd: PathBuf::from(DEFAULT_RCSD),
            runparts: None,
            cmdline_level: params.runlevel,
        };
        state.set_configured_level(DEFAULT_RUNLEVEL);
        state
    }

    /// Record the level from the config file, honouring kernel overrides.
    ///
    /// `single` always wins, then an explicit level on the kernel command line.
    pub fn set_configured_level(&mut self, level: u8) {
        self.cfglevel = if self.single {
            1
        } else {
            self.cmdline_level.unwrap_or(level)
        };
    }

    /// The level finalize committed to, if it has run.
    pub fn target(&self) -> Option<Runlevel> {
        self.target
    }

    /// Whether finalize has run.
    pub fn finalized(&self) -> bool {
        self.target.is_some()
    }

    /// Commit the target runlevel. Only the first call takes effect.
    pub fn commit_target(&mut self) -> Option<Runlevel> {
        if self.target.is_some() {
            return None;
        }
        let level = Runlevel::Level(self.cfglevel);
        self.target = Some(level);
        self.enter(level);
        Some(level)
    }

    /// Move to a new current level, remembering the old one.
    pub fn enter(&mut self, level: Runlevel) {
        if self.runlevel != level {
            self.prevlevel = Some(self.runlevel);
            self.runlevel = level;
        }
    }
}
