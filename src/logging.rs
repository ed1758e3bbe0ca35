//! Console log verbosity.
//!
//! The filter sits behind a `reload` layer so bootstrap can start verbose
//! (or quiet, under splash) and go silent once the system is up.

use crate::cmdline::BootParams;
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Console verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, requested with `debug` on the kernel command line
    Debug,
    /// Informational messages
    Normal,
    /// `quiet` or `splash`: errors only until bootstrap completes
    Quiet,
    /// After bootstrap: errors only, whatever the boot level was
    Silent,
}

impl LogLevel {
    /// Pick the initial level from the kernel command line.
    pub fn from_params(params: &BootParams) -> Self {
        if params.debug {
            LogLevel::Debug
        } else if params.quiet || params.splash {
            LogLevel::Quiet
        } else {
            LogLevel::Normal
        }
    }

    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Normal => "info",
            LogLevel::Quiet => "error",
            LogLevel::Silent => "error",
        }
    }
}

/// Handle on the process-wide subscriber.
pub struct LogControl {
    level: LogLevel,
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogControl {
    /// Install the global subscriber. `RUST_LOG` wins over `level` when set.
    pub fn install(level: LogLevel) -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
        let (filter, handle) = reload::Layer::new(filter);

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .is_ok();

        Self {
            level,
            handle: installed.then_some(handle),
        }
    }

    /// Track the level without touching any subscriber.
    pub fn detached(level: LogLevel) -> Self {
        Self {
            level,
            handle: None,
        }
    }

    /// Current level.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Switch verbosity at runtime.
    pub fn set_level(&mut self, level: LogLevel) {
        if let Some(ref handle) = self.handle {
            if let Err(e) = handle.reload(EnvFilter::new(level.directive())) {
                warn!(error = %e, "Failed to change log level");
            }
        }
        self.level = level;
    }

    /// Go silent, the last thing bootstrap does before starting TTYs.
    pub fn silence(&mut self) {
        self.set_level(LogLevel::Silent);
    }

    /// Whether console chatter such as the banner should be held back.
    pub fn is_silent(&self) -> bool {
        matches!(self.level, LogLevel::Quiet | LogLevel::Silent)
    }

    pub fn is_debug(&self) -> bool {
        self.level == LogLevel::Debug
    }
}
