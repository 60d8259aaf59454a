//! Launching, signalling and reaping frameserver processes.
//!
//! The controller only sees the [`ProcessHandle`] and [`ProcessLauncher`]
//! traits; [`SystemLauncher`] is the `std::process` implementation.

use super::config::LaunchCommand;
use crate::error::{Error, Result};
use crate::ipc::CONTROL_FD;
use rustix::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use rustix::io::{Errno, FdFlags, fcntl_getfd, fcntl_setfd};
use rustix::process::{Pid, Signal, kill_process};
use std::fmt;
use std::mem::ManuallyDrop;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitKind {
    /// Whether the child exited with status 0.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Exited(-1),
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Signals the controller sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermSignal {
    /// Polite request to stop.
    Hangup,
    /// Escalation after the grace period.
    Kill,
}

/// A running (or reaped) child process.
pub trait ProcessHandle: fmt::Debug {
    /// Process id.
    fn pid(&self) -> i32;

    /// Send a termination signal. Signalling a reaped child is a no-op.
    fn signal(&mut self, signal: TermSignal) -> Result<()>;

    /// Non-blocking reap. `Some` once the child has exited; repeated calls
    /// after that keep returning the same status.
    fn try_reap(&mut self) -> Result<Option<ExitKind>>;

    /// Block until the child exits.
    fn wait(&mut self) -> Result<ExitKind>;
}

/// Something that can start frameservers.
pub trait ProcessLauncher: fmt::Debug {
    /// Start `command`. `control` is the child end of the descriptor
    /// channel, to be installed at the reserved control descriptor.
    fn launch(&mut self, command: &LaunchCommand, control: Option<OwnedFd>) -> Result<Box<dyn ProcessHandle>>;
}

/// Launches frameservers as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&mut self, command: &LaunchCommand, control: Option<OwnedFd>) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        if let Some(control) = &control {
            let raw = control.as_raw_fd();
            // SAFETY: the closure only issues async-signal-safe syscalls.
            unsafe {
                cmd.pre_exec(move || {
                    let src = BorrowedFd::borrow_raw(raw);
                    if raw == CONTROL_FD {
                        let flags = fcntl_getfd(src)?;
                        fcntl_setfd(src, flags.difference(FdFlags::CLOEXEC))?;
                    } else {
                        // Never closed here: the exec replaces the image.
                        let mut target = ManuallyDrop::new(OwnedFd::from_raw_fd(CONTROL_FD));
                        rustix::io::dup2(src, &mut *target)?;
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| {
            Error::BadArgument(format!("cannot execute {}: {e}", command.program.display()))
        })?;
        // The parent's copy of the child end is no longer needed.
        drop(control);

        tracing::debug!(pid = child.id(), program = %command.program.display(), "frameserver launched");
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// A `std::process::Child` behind [`ProcessHandle`].
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exit: Option<ExitKind>,
}

impl ChildProcess {
    /// Wrap a spawned child.
    pub fn new(child: Child) -> Self {
        Self { child, exit: None }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn signal(&mut self, signal: TermSignal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let pid = Pid::from_child(&self.child);
        let sig = match signal {
            TermSignal::Hangup => Signal::HUP,
            TermSignal::Kill => Signal::KILL,
        };
        match kill_process(pid, sig) {
            Ok(()) | Err(Errno::SRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn try_reap(&mut self) -> Result<Option<ExitKind>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let exit = self.child.try_wait()?.map(ExitKind::from_status);
        self.exit = exit;
        Ok(exit)
    }

    fn wait(&mut self) -> Result<ExitKind> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = ExitKind::from_status(self.child.wait()?);
        self.exit = Some(exit);
        Ok(exit)
    }
}
