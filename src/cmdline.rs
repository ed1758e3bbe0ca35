//! Kernel command line handling.
//!
//! The kernel hands init every word it does not recognise itself, so
//! anything unknown here is silently ignored.

/// Boot parameters picked from the kernel-supplied argument vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    /// `debug`: verbose logging, no progress display
    pub debug: bool,
    /// `quiet`: only errors on the console until bootstrap completes
    pub quiet: bool,
    /// `rescue` or `recover`: skip fsck and operator scripts
    pub rescue: bool,
    /// `single` or `S`: single-user mode
    pub single: bool,
    /// `splash`: progress display, diagnostics held back
    pub splash: bool,
    /// Bare runlevel digit overriding the configured default
    pub runlevel: Option<u8>,
}

impl BootParams {
    /// Parse the argument vector (without the program name).
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::default();

        for arg in args {
            match arg.as_ref() {
                "debug" | "init.debug" => params.debug = true,
                "quiet" => params.quiet = true,
                "rescue" | "recover" => params.rescue = true,
                "single" | "S" => params.single = true,
                "splash" => params.splash = true,
                // 0 is halt and 6 is reboot, neither is a boot target
                word if word.len() == 1 => {
                    if let Some(level) = word.chars().next().and_then(|c| c.to_digit(10)) {
                        if level != 0 && level != 6 {
                            params.runlevel = Some(level as u8);
                        }
                    }
                }
                _ => {}
            }
        }

        params
    }
}
