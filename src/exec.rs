//! Running external commands during boot.
//!
//! Early boot runs tools such as `fsck`, `mount` and `swapon` synchronously:
//! nothing else can usefully happen until they return.

use crate::console::Console;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, error, warn};

/// Exit code reported when a command could not be started at all.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Something that can run a command to completion and report its exit code.
pub trait CommandRunner {
    /// Run `argv` with extra environment variables, wait for it, and return
    /// its exit code (`128 + signal` if it was killed).
    fn run(&self, argv: &[&str], env: &[(&str, &str)]) -> i32;
}

/// Runs commands with `std::process::Command`, inheriting the console.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[&str], env: &[(&str, &str)]) -> i32 {
        let Some((program, args)) = argv.split_first() else {
            error!("Refusing to run empty command");
            return EXIT_SPAWN_FAILED;
        };

        debug!(command = %argv.join(" "), "Running");

        let status = Command::new(program)
            .args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .status();

        match status {
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => code,
                (None, Some(sig)) => 128 + sig,
                (None, None) => 1,
            },
            Err(e) => {
                warn!(command = %program, error = %e, "Failed to start command");
                EXIT_SPAWN_FAILED
            }
        }
    }
}

/// A runner paired with the console, so each command shows up as a
/// progress line.
pub struct Interactive<'a> {
    runner: &'a dyn CommandRunner,
    console: &'a Console,
}

impl<'a> Interactive<'a> {
    pub fn new(runner: &'a dyn CommandRunner, console: &'a Console) -> Self {
        Self { runner, console }
    }

    /// Run a command, reporting `desc` with its outcome. Returns the exit code.
    pub fn run(&self, argv: &[&str], desc: &str) -> i32 {
        let code = self.runner.run(argv, &[]);
        self.console.step(desc, code == 0);
        code
    }

    /// Run a command without a progress line.
    pub fn run_quiet(&self, argv: &[&str]) -> i32 {
        self.runner.run(argv, &[])
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    pub fn console(&self) -> &Console {
        self.console
    }
}

/// Whether `path` is a regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Executables in `dir`, in name order. Dotfiles and editor backups are skipped.
pub fn executables_in(dir: &Path) -> Vec<std::path::PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot read script directory");
            return Vec::new();
        }
    };

    let mut scripts: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            !name.starts_with('.') && !name.ends_with('~') && is_executable(path)
        })
        .collect();
    scripts.sort();
    scripts
}

/// Run every executable in `dir`, in order, each with `start` as its only
/// argument. Returns the number of scripts that failed.
pub fn run_parts(interactive: &Interactive<'_>, dir: &Path) -> usize {
    let mut failed = 0;

    for script in executables_in(dir) {
        let path = script.to_string_lossy().into_owned();
        let code = interactive.run(&[path.as_str(), "start"], &format!("Calling {}", path));
        if code != 0 {
            failed += 1;
        }
    }

    failed
}
