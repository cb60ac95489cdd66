//! Graceful stop: an interrupt delivered to the child's process group.
//!
//! The sequence is attach, suppress, send, wait, restore, detach. Suppress
//! and restore bracket the send and the wait, so the supervisor's own
//! interrupt handling comes back however the middle went. Every step after a
//! successful attach is attempted; the first failure is returned and later
//! ones are logged.

#![allow(unsafe_code)]

use crate::error::Result;

/// The platform calls behind a graceful stop, one method per step.
pub trait SignalContext {
    /// Joins the signal-delivery scope of `pid`'s process group.
    fn attach(&mut self, pid: u32) -> Result<()>;

    /// Stops the supervisor from being interrupted by what it sends.
    fn suppress_interrupt(&mut self) -> Result<()>;

    /// Interrupts every process in the attached group.
    fn send_interrupt(&mut self) -> Result<()>;

    fn restore_interrupt(&mut self) -> Result<()>;

    fn detach(&mut self) -> Result<()>;
}

/// Runs the interrupt sequence against `pid`, waiting for its exit with
/// `wait_for_exit` while the interrupt is suppressed.
///
/// The wait only happens if the interrupt was sent.
pub fn request_graceful_stop<C, W>(ctx: &mut C, pid: u32, wait_for_exit: W) -> Result<()>
where
    C: SignalContext + ?Sized,
    W: FnOnce() -> Result<()>,
{
    ctx.attach(pid)?;
    debug!("Attached to process group of {}", pid);

    let mut first = None;
    let mut note = |step: &str, result: Result<()>| {
        if let Err(err) = result {
            if first.is_none() {
                first = Some(err);
            } else {
                warn!("Graceful stop of {}: {} failed: {}", pid, step, err);
            }
        }
    };

    let suppressed = ctx.suppress_interrupt();
    let suppressed_ok = suppressed.is_ok();
    note("suppress interrupt", suppressed);

    if suppressed_ok {
        let sent = ctx.send_interrupt();
        let sent_ok = sent.is_ok();
        note("send interrupt", sent);

        if sent_ok {
            info!("Sent interrupt to process {}, waiting for exit", pid);
            note("wait for exit", wait_for_exit());
        }

        note("restore interrupt", ctx.restore_interrupt());
    }

    note("detach", ctx.detach());

    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub use self::imp::platform_context;
#[cfg(unix)]
pub use self::imp::ProcessGroupSignals;
#[cfg(windows)]
pub use self::imp::ConsoleSignals;

#[cfg(unix)]
mod imp {
    use nix::sys::signal::{killpg, signal, SigHandler, Signal};
    use nix::unistd::{getpgid, Pid};

    use super::SignalContext;
    use crate::error::{Error, Result};

    /// Interrupts a process group with `SIGINT`, ignoring `SIGINT` in the
    /// supervisor meanwhile.
    #[derive(Debug, Default)]
    pub struct ProcessGroupSignals {
        group: Option<Pid>,
        previous: Option<SigHandler>,
    }

    pub fn platform_context() -> ProcessGroupSignals {
        ProcessGroupSignals::default()
    }

    fn os(about: &'static str) -> impl FnOnce(nix::errno::Errno) -> Error {
        move |errno| Error::Os {
            about,
            err: errno.into(),
        }
    }

    impl SignalContext for ProcessGroupSignals {
        fn attach(&mut self, pid: u32) -> Result<()> {
            let group = getpgid(Some(Pid::from_raw(pid as i32)))
                .map_err(os("attach to process group"))?;
            self.group = Some(group);
            Ok(())
        }

        fn suppress_interrupt(&mut self) -> Result<()> {
            let previous = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }
                .map_err(os("suppress interrupt"))?;
            self.previous = Some(previous);
            Ok(())
        }

        fn send_interrupt(&mut self) -> Result<()> {
            let group = self.group.ok_or_else(|| Error::Os {
                about: "send interrupt",
                err: nix::errno::Errno::ESRCH.into(),
            })?;
            killpg(group, Signal::SIGINT).map_err(os("send interrupt"))
        }

        fn restore_interrupt(&mut self) -> Result<()> {
            if let Some(previous) = self.previous.take() {
                unsafe { signal(Signal::SIGINT, previous) }.map_err(os("restore interrupt"))?;
            }
            Ok(())
        }

        fn detach(&mut self) -> Result<()> {
            self.group = None;
            Ok(())
        }
    }
}

#[cfg(windows)]
mod imp {
    use winapi::{
        shared::minwindef::{FALSE, TRUE},
        um::{
            consoleapi::SetConsoleCtrlHandler,
            wincon::{
                AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, GetConsoleWindow,
                ATTACH_PARENT_PROCESS, CTRL_C_EVENT,
            },
        },
    };

    use super::SignalContext;
    use crate::error::{Error, Result};

    /// Sends Ctrl+C through the child's console.
    ///
    /// A process can only raise console events on the console it is attached
    /// to, so the supervisor leaves its own console (if any), joins the
    /// child's, and ignores Ctrl+C for the duration. On detach it goes back
    /// to the console it came from.
    #[derive(Debug, Default)]
    pub struct ConsoleSignals {
        attached: bool,
        had_console: bool,
    }

    pub fn platform_context() -> ConsoleSignals {
        ConsoleSignals::default()
    }

    impl SignalContext for ConsoleSignals {
        fn attach(&mut self, pid: u32) -> Result<()> {
            self.had_console = !unsafe { GetConsoleWindow() }.is_null();
            if self.had_console && unsafe { FreeConsole() } == 0 {
                return Err(Error::last_os("leave own console"));
            }
            if unsafe { AttachConsole(pid) } == 0 {
                let err = Error::last_os("attach to console");
                self.rejoin();
                return Err(err);
            }
            self.attached = true;
            Ok(())
        }

        fn suppress_interrupt(&mut self) -> Result<()> {
            if unsafe { SetConsoleCtrlHandler(None, TRUE) } == 0 {
                return Err(Error::last_os("suppress interrupt"));
            }
            Ok(())
        }

        fn send_interrupt(&mut self) -> Result<()> {
            if unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) } == 0 {
                return Err(Error::last_os("send interrupt"));
            }
            Ok(())
        }

        fn restore_interrupt(&mut self) -> Result<()> {
            if unsafe { SetConsoleCtrlHandler(None, FALSE) } == 0 {
                return Err(Error::last_os("restore interrupt"));
            }
            Ok(())
        }

        fn detach(&mut self) -> Result<()> {
            if !self.attached {
                return Ok(());
            }
            self.attached = false;
            let freed = unsafe { FreeConsole() };
            let err = (freed == 0).then(|| Error::last_os("detach from console"));
            self.rejoin();
            err.map_or(Ok(()), Err)
        }
    }

    impl ConsoleSignals {
        /// Back to the console the launcher was started from, if it had one.
        fn rejoin(&mut self) {
            if std::mem::take(&mut self.had_console)
                && unsafe { AttachConsole(ATTACH_PARENT_PROCESS) } == 0
            {
                warn!("Could not reattach to the launcher's console");
            }
        }
    }
}
