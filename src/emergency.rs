//! Emergency shell for debugging a new init setup.
//!
//! Built only with the `emergency-shell` feature. Do not ship it: anyone at
//! the console gets a root shell, no password asked, once init crashes.
//!
//! The process forks before anything else happens. The child carries on
//! with the boot. The parent keeps PID 1, since the kernel panics only when
//! PID 1 dies, and sits in `waitpid` reaping orphans until the child is
//! gone. Then it takes the console and becomes `/bin/sh`.

/// Which side of the fork this process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Carries every boot duty
    Continuing,
}

/// Fork the watcher, if compiled in. Only the continuing process returns.
#[cfg(feature = "emergency-shell")]
pub fn spawn_watchdog() -> Role {
    use nix::unistd::{fork, ForkResult};
    use tracing::{error, warn};

    warn!("Emergency shell enabled, do not use in production");

    match unsafe { fork() } {
        Ok(ForkResult::Child) => Role::Continuing,
        Ok(ForkResult::Parent { child }) => watcher::run(child),
        Err(e) => {
            error!(error = %e, "Cannot fork emergency shell watcher");
            Role::Continuing
        }
    }
}

/// Fork the watcher, if compiled in. Only the continuing process returns.
#[cfg(not(feature = "emergency-shell"))]
pub fn spawn_watchdog() -> Role {
    Role::Continuing
}

#[cfg(feature = "emergency-shell")]
mod watcher {
    use crate::host::PATH_BSHELL;
    use nix::errno::Errno;
    use nix::sys::wait::waitpid;
    use nix::unistd::{execv, setsid, Pid};
    use std::ffi::CString;
    use std::time::Duration;
    use tracing::error;

    /// Block until `boot` exits, then replace this process with a shell.
    pub fn run(boot: Pid) -> ! {
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) if status.pid() == Some(boot) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "Lost track of init");
                    break;
                }
            }
        }

        error!("Embarrassingly, init has crashed. Check /dev/kmsg for details.");
        error!("To debug, add 'debug' to the kernel command line.");

        // Session leader with a controlling TTY, so job control and Ctrl-C work
        let _ = setsid();
        unsafe {
            libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 1);
        }

        if let Ok(shell) = CString::new(PATH_BSHELL) {
            let Err(e) = execv(&shell, &[&shell]);
            error!(shell = PATH_BSHELL, error = %e, "Cannot start emergency shell");
        }

        // PID 1 must not exit
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
}
