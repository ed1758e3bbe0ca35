//! Filesystem checks and the root remount decision.
//!
//! Entries in `/etc/fstab` are checked in ascending pass order. Later
//! passes may depend on earlier ones, so a failing pass ends the walk and
//! root stays read-only.

use crate::error::{Error, Result};
use crate::exec::Interactive;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default filesystem table.
pub const FSTAB: &str = "/etc/fstab";

/// Default mount table used to see what is already mounted.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Highest fsck pass number walked.
pub const MAX_PASS: u8 = 9;

/// One line of the filesystem table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Device specifier: a path, `UUID=...` or `LABEL=...`
    pub spec: String,
    /// Mount point
    pub file: String,
    /// Filesystem type
    pub vfstype: String,
    /// Mount options
    pub options: Vec<String>,
    /// Dump frequency
    pub freq: u32,
    /// fsck pass, 0 means never checked
    pub passno: u8,
}

impl FstabEntry {
    /// Whether the entry asks to be mounted read-only.
    pub fn read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }

    /// Whether the specifier is a tag the checker resolves itself.
    pub fn is_tag_reference(&self) -> bool {
        self.spec.starts_with("UUID=") || self.spec.starts_with("LABEL=")
    }
}

/// Parsed filesystem table.
#[derive(Debug, Clone, Default)]
pub struct Fstab {
    entries: Vec<FstabEntry>,
}

impl Fstab {
    /// Read and parse a table from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Fstab {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::parse(&content, path))
    }

    /// Parse table contents. Malformed lines are logged against `path` and
    /// skipped; unparsable numbers count as 0.
    pub fn parse(content: &str, path: &Path) -> Self {
        let mut entries = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    "Skipping fstab line without device and mount point"
                );
                continue;
            }

            let number = |idx: usize| -> u32 {
                fields.get(idx).map_or(0, |field| {
                    field.parse().unwrap_or_else(|_| {
                        warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            field = %field,
                            "Bad number in fstab, using 0"
                        );
                        0
                    })
                })
            };

            entries.push(FstabEntry {
                spec: unescape(fields[0]),
                file: unescape(fields[1]),
                vfstype: fields.get(2).unwrap_or(&"auto").to_string(),
                options: fields
                    .get(3)
                    .unwrap_or(&"defaults")
                    .split(',')
                    .map(str::to_string)
                    .collect(),
                freq: number(4),
                passno: number(5).min(u8::MAX as u32) as u8,
            });
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[FstabEntry] {
        &self.entries
    }

    /// The entry for `/`, if listed.
    pub fn root(&self) -> Option<&FstabEntry> {
        self.entries.iter().find(|entry| entry.file == "/")
    }

    /// Entries checked in the given pass, in table order.
    pub fn pass(&self, pass: u8) -> impl Iterator<Item = &FstabEntry> {
        self.entries.iter().filter(move |entry| entry.passno == pass)
    }
}

/// fstab escapes whitespace in paths as octal, e.g. `\040` for a space.
/// Escapes may encode any byte, so the result is decoded once at the end.
fn unescape(field: &str) -> String {
    let raw = field.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let octal = raw
            .get(i + 1..i + 4)
            .filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match (raw[i], octal) {
            (b'\\', Some(byte)) => {
                out.push(byte);
                i += 4;
            }
            (byte, _) => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Questions the checker asks about devices and mounts.
pub trait FsProbe {
    /// Whether `spec` names a block special file.
    fn is_block_device(&self, spec: &str) -> bool;

    /// Whether `mountpoint` is currently mounted read-write.
    fn is_mounted_rw(&self, mountpoint: &str) -> bool;
}

/// Probe backed by the live system and a mount table such as `/proc/mounts`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    mounts: PathBuf,
}

impl SystemProbe {
    pub fn new(mounts: impl Into<PathBuf>) -> Self {
        Self {
            mounts: mounts.into(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(PROC_MOUNTS)
    }
}

impl FsProbe for SystemProbe {
    fn is_block_device(&self, spec: &str) -> bool {
        use std::os::unix::fs::FileTypeExt;

        match std::fs::metadata(spec) {
            Ok(meta) => meta.file_type().is_block_device(),
            Err(e) => {
                debug!(spec = spec, error = %e, "Cannot stat device");
                false
            }
        }
    }

    fn is_mounted_rw(&self, mountpoint: &str) -> bool {
        let Ok(table) = std::fs::read_to_string(&self.mounts) else {
            return false;
        };

        table.lines().any(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields.len() >= 4
                && unescape(fields[1]) == mountpoint
                && fields[3].split(',').any(|opt| opt == "rw")
        })
    }
}

/// Result of walking every fsck pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsckOutcome {
    /// Every checked filesystem came back clean
    Clean,
    /// A pass had failures; later passes were not attempted
    PassFailed { pass: u8, devices: Vec<String> },
    /// The table itself could not be read
    TableUnreadable,
}

impl FsckOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, FsckOutcome::Clean)
    }
}

/// Check every filesystem in the table, pass by pass.
///
/// Within a pass every eligible entry is checked; if any of them fails the
/// walk stops before the next pass.
pub fn check_all(fstab: &Fstab, probe: &dyn FsProbe, interactive: &Interactive<'_>) -> FsckOutcome {
    for pass in 1..=MAX_PASS {
        let mut failed = Vec::new();

        for entry in fstab.pass(pass) {
            if !probe.is_block_device(&entry.spec) && !entry.is_tag_reference() {
                debug!(spec = %entry.spec, "Cannot fsck, not a block device");
                continue;
            }

            if probe.is_mounted_rw(&entry.file) {
                debug!(
                    spec = %entry.spec,
                    mountpoint = %entry.file,
                    "Skipping fsck, already mounted read-write"
                );
                continue;
            }

            let desc = format!("Checking filesystem {}", entry.spec);
            let code = interactive.run(&["fsck", "-a", &entry.spec], &desc);
            if code != 0 {
                warn!(spec = %entry.spec, pass = pass, code = code, "fsck failed");
                failed.push(entry.spec.clone());
            }
        }

        if !failed.is_empty() {
            return FsckOutcome::PassFailed {
                pass,
                devices: failed,
            };
        }
    }

    FsckOutcome::Clean
}

/// What to do about `/` once checks are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountDecision {
    /// Remount `/` read-write
    Remount,
    /// `/` is listed read-only, leave it alone
    SkipReadOnly,
    /// A check failed, so `/` stays as the kernel mounted it
    SkipFsckFailed,
}

/// Decide whether `/` gets remounted read-write.
///
/// A read-only root entry always wins. Otherwise the remount happens only
/// when every check passed, whether or not `/` is listed at all.
pub fn remount_decision(fstab: Option<&Fstab>, outcome: &FsckOutcome) -> RemountDecision {
    if fstab.and_then(Fstab::root).is_some_and(FstabEntry::read_only) {
        return RemountDecision::SkipReadOnly;
    }

    if outcome.is_clean() {
        RemountDecision::Remount
    } else {
        RemountDecision::SkipFsckFailed
    }
}

/// Check filesystems listed in `fstab_path`, then remount `/` if allowed.
pub fn prepare_root(
    fstab_path: &Path,
    probe: &dyn FsProbe,
    interactive: &Interactive<'_>,
) -> (FsckOutcome, RemountDecision) {
    let fstab = match Fstab::load(fstab_path) {
        Ok(fstab) => Some(fstab),
        Err(e) => {
            warn!(error = %e, "Failed opening fstab");
            None
        }
    };

    let outcome = match fstab {
        Some(ref fstab) => check_all(fstab, probe, interactive),
        None => FsckOutcome::TableUnreadable,
    };

    let decision = remount_decision(fstab.as_ref(), &outcome);
    match decision {
        RemountDecision::Remount => {
            interactive.run(&["mount", "-n", "-o", "remount,rw", "/"], "Remounting / as read-write");
        }
        RemountDecision::SkipReadOnly => {
            info!("Root filesystem listed read-only, not remounting");
        }
        RemountDecision::SkipFsckFailed => {
            interactive
                .console()
                .notice("Cannot remount / as read-write, fsck failed before");
        }
    }

    (outcome, decision)
}
