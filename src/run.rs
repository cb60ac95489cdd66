//! The console host: start the server, wait for a reason to stop, stop it.

use std::io::Write;
use std::sync::mpsc::{channel, Sender};

use crate::capture::{shared, LogSink};
use crate::config::Config;
use crate::error::Result;
use crate::launch::ExitStatus;
use crate::supervisor::Supervisor;
use crate::interrupt;

/// Why the host stopped waiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HostEvent {
    Interrupt,
    ChildExited(ExitStatus),
}

/// Sets up `env_logger` for the launcher.
///
/// The launcher's own messages are shown from warnings up, more with each
/// `-v`; the server's output is always shown from info up.
pub fn init_logger(verbosity: u64) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let built = env_logger::Builder::new()
        .format(|buf, r| {
            if r.target() == "server" {
                writeln!(buf, "{}", r.args())
            } else {
                writeln!(buf, "*** {}", r.args())
            }
        })
        .filter(None, level)
        .filter(Some("server"), level.max(log::LevelFilter::Info))
        .try_init();
    if built.is_err() {
        debug!("Logger already initialised");
    }
}

/// Runs the server until it exits or the launcher is asked to stop.
///
/// Returns the server's exit status, if it is known.
pub fn run(config: Config) -> Result<Option<ExitStatus>> {
    let invocation = config.invocation()?;

    let (tx, rx) = channel();
    let interrupts = tx.clone();
    interrupt::install(move || notify(&interrupts, HostEvent::Interrupt))?;

    let mut supervisor = Supervisor::start(&invocation, shared(LogSink), move |status| {
        notify(&tx, HostEvent::ChildExited(status))
    })?;

    match rx.recv() {
        Ok(HostEvent::Interrupt) => info!("Interrupted, stopping server"),
        Ok(HostEvent::ChildExited(status)) => info!("Server exited by itself ({})", status),
        Err(_) => warn!("Lost track of the server, stopping it"),
    }

    supervisor.stop()
}

fn notify(tx: &Sender<HostEvent>, event: HostEvent) {
    if tx.send(event).is_err() {
        debug!("Host no longer listening for {:?}", event);
    }
}
