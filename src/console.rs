//! Boot banner and progress output.

use std::io::Write;
use tracing::{info, warn};

/// Heading printed once at boot.
pub const INIT_HEADING: &str = "Buckos init";

const WIDTH: usize = 72;

/// Console output for the boot sequence.
///
/// With progress on, each step gets an `[ OK ]` or `[FAIL]` line on the
/// console. With it off (rescue or debug boots), steps are logged instead.
#[derive(Debug, Default)]
pub struct Console {
    progress: bool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn the progress display on.
    pub fn enable_progress(&mut self) {
        self.progress = true;
    }

    pub fn progress_enabled(&self) -> bool {
        self.progress
    }

    /// Print the boot banner.
    pub fn banner(&self, heading: &str) {
        if !self.progress {
            info!("{} starting", heading);
            return;
        }

        let rule = "=".repeat(WIDTH);
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\n{}\n{:^width$}\n{}", rule, heading, rule, width = WIDTH);
        let _ = out.flush();
    }

    /// Report the outcome of one step.
    pub fn step(&self, desc: &str, ok: bool) {
        if self.progress {
            let status = if ok { "[ OK ]" } else { "[FAIL]" };
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{} {}", status, desc);
            let _ = out.flush();
        } else if ok {
            info!("{}", desc);
        } else {
            warn!("{} failed", desc);
        }
    }

    /// Print a diagnostic that must reach the operator even under splash.
    pub fn notice(&self, message: &str) {
        warn!("{}", message);
        if self.progress {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "[WARN] {}", message);
            let _ = out.flush();
        }
    }
}
