//! Relays termination requests aimed at the launcher itself (Ctrl+C,
//! `SIGTERM`, console close) to a handler.
//!
//! Must be installed before any other thread is started, so that on Unix all
//! of them inherit the signal mask and only the relay thread sees the
//! signals.

#![allow(unsafe_code)]

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock;

type Handler = Box<dyn Fn() + Send>;

lazy_static! {
    static ref HANDLER: Mutex<Option<Handler>> = Mutex::new(None);
}

fn set_handler<F>(handler: F)
where
    F: Fn() + Send + 'static,
{
    *lock(&HANDLER) = Some(Box::new(handler));
}

fn invoke() {
    if let Some(handler) = &*lock(&HANDLER) {
        handler();
    }
}

/// On Unix, block the termination signals and wait for them on a thread.
#[cfg(unix)]
pub fn install<F>(handler: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    use nix::sys::signal::{SigSet, Signal};
    use std::thread;

    // the mask propagates to all threads started after this point
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGHUP);
    mask.thread_set_mask().map_err(|errno| Error::Os {
        about: "block termination signals",
        err: errno.into(),
    })?;

    set_handler(handler);

    thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || loop {
            match mask.wait() {
                Ok(signal) => {
                    debug!("Received {:?}", signal);
                    invoke();
                }
                Err(errno) => {
                    error!("Waiting for signals failed: {}", errno);
                    break;
                }
            }
        })
        .map_err(Error::os("spawn interrupt thread"))?;

    Ok(())
}

/// On Windows, use SetConsoleCtrlHandler(), which runs the handler on a
/// thread of its own.
#[cfg(windows)]
pub fn install<F>(handler: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    use winapi::{
        shared::minwindef::{BOOL, DWORD, TRUE},
        um::consoleapi::SetConsoleCtrlHandler,
    };

    unsafe extern "system" fn ctrl_handler(kind: DWORD) -> BOOL {
        debug!("Received console control event {}", kind);
        invoke();
        TRUE
    }

    set_handler(handler);

    if unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) } == 0 {
        return Err(Error::last_os("install console control handler"));
    }

    Ok(())
}
