//! The supervisor: one contained child, its output readers and its exit
//! monitor.

use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{
    capture::{spawn_reader, Severity, SharedSink},
    cmdline,
    container::ProcessContainer,
    error::{Error, Result},
    launch::{launch_suspended, ChildProcess, ExitStatus, LaunchState},
    pipe::output_channel,
    shutdown::{platform_context, request_graceful_stop},
};

/// What to run: the resolved command, its arguments, and where.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = self.command.to_string_lossy();
        let line = cmdline::join_windows(
            std::iter::once(command.as_ref()).chain(self.args.iter().map(String::as_str)),
        );
        f.write_str(&line)
    }
}

/// Supervises a single child from launch to teardown.
///
/// The child runs inside a [`ProcessContainer`], so whatever happens to the
/// supervisor, dropping it kills the child and everything the child started.
#[derive(Debug)]
pub struct Supervisor {
    child: Option<Arc<ChildProcess>>,
    container: Option<ProcessContainer>,
    readers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Launches the child and starts capturing its output.
    ///
    /// `on_unsolicited_exit` is called (from the monitor thread) if the child
    /// exits without having been asked to stop. It is never called after
    /// [`stop`](Self::stop) has begun.
    ///
    /// On Linux the child is killed if the thread calling this exits, so call
    /// it from a thread that lives as long as the supervisor.
    pub fn start<F>(
        invocation: &Invocation,
        sink: SharedSink,
        on_unsolicited_exit: F,
    ) -> Result<Self>
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        info!("Starting server: {}", invocation);
        Self::launch(invocation, sink, on_unsolicited_exit).map_err(|err| {
            error!("Failed to start server: {}", err);
            err
        })
    }

    fn launch<F>(invocation: &Invocation, sink: SharedSink, on_unsolicited_exit: F) -> Result<Self>
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        let mut container = ProcessContainer::create()?;

        let (stdout, stdout_end) = output_channel().map_err(Error::os("create stdout pipe"))?;
        let (stderr, stderr_end) = output_channel().map_err(Error::os("create stderr pipe"))?;

        let child = launch_suspended(
            &invocation.command,
            &invocation.args,
            &invocation.working_dir,
            stdout_end,
            stderr_end,
        )?;

        // on any early return from here, dropping the container kills the
        // parked child
        container.add_process(&child)?;
        child.resume()?;
        info!("Server running as process {}", child.pid());

        let child = Arc::new(child);
        let mut supervisor = Self {
            child: Some(child.clone()),
            container: Some(container),
            readers: Vec::with_capacity(2),
            monitor: None,
        };

        supervisor.readers.push(
            spawn_reader("stdout", stdout, Severity::Information, sink.clone())
                .map_err(Error::os("spawn stdout reader"))?,
        );
        supervisor.readers.push(
            spawn_reader("stderr", stderr, Severity::Error, sink)
                .map_err(Error::os("spawn stderr reader"))?,
        );

        supervisor.monitor = Some(
            thread::Builder::new()
                .name("exit-monitor".into())
                .spawn(move || monitor(&child, on_unsolicited_exit))
                .map_err(Error::os("spawn exit monitor"))?,
        );

        Ok(supervisor)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid())
    }

    pub fn is_running(&self) -> bool {
        self.child.as_ref().map_or(false, |child| {
            matches!(child.state(), LaunchState::Running | LaunchState::Stopping)
        })
    }

    /// Asks the child to shut down and waits for it, then tears down.
    ///
    /// Returns the child's exit status if it is known. Calling this again
    /// after it returned does nothing and returns `Ok(None)`.
    pub fn stop(&mut self) -> Result<Option<ExitStatus>> {
        let child = match self.child.clone() {
            Some(child) => child,
            None => return Ok(None),
        };

        if !child.try_begin_stop() {
            debug!("Server already exited or stopping, waiting");
        } else if let Some(status) = child.exit_status() {
            // the monitor saw the exit but lost the latch to us
            info!("Server already exited with {}", status);
        } else {
            info!("Stopping server (process {})", child.pid());
            let mut ctx = platform_context();
            let stopped = request_graceful_stop(&mut ctx, child.pid(), || child.wait().map(drop));
            if let Err(err) = stopped {
                warn!("Graceful stop failed, killing server: {}", err);
            }
        }

        self.teardown();
        Ok(child.exit_status())
    }

    /// Container first, while the child is at most an unreaped zombie and its
    /// process group still exists. Then the child, then threads.
    fn teardown(&mut self) {
        let child = self.child.take();

        if let Some(mut container) = self.container.take() {
            container.release();
        }

        if let Some(child) = child {
            if let Err(err) = child.reap() {
                warn!("Failed to reap server process {}: {}", child.pid(), err);
            }
        }

        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                warn!("Exit monitor panicked");
            }
        }

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                warn!("Output reader panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(child) = &self.child {
            // the monitor must not report a kill we caused ourselves
            child.try_begin_stop();
        }
        self.teardown();
    }
}

/// Watches for the exit without reaping; the ID stays reserved until
/// teardown.
fn monitor<F>(child: &ChildProcess, on_unsolicited_exit: F)
where
    F: FnOnce(ExitStatus),
{
    match child.wait() {
        Ok(status) => {
            if child.try_begin_stop() {
                warn!("Server exited unexpectedly with {}", status);
                on_unsolicited_exit(status);
            } else {
                info!("Server exited with {}", status);
            }
        }
        Err(err) => error!("Failed to wait for server process {}: {}", child.pid(), err),
    }
}
