//! oie-launcher: the library
//!
//! Runs the Open Integration Engine server (a Java program) as a supervised
//! child process. The child is created suspended, placed in a
//! [`ProcessContainer`](container::ProcessContainer) which kills it (and
//! anything it spawned) when released, and only then allowed to run. Its
//! output is read line by line, classified by log level and handed to an
//! [`EventSink`](capture::EventSink). Stopping asks the server to shut down
//! with an interrupt, the way Ctrl+C would in a console.
//!
//! The binary wraps this in a small console host; service managers can drive
//! [`Supervisor`](supervisor::Supervisor) directly.

#![deny(deprecated)]
#![deny(unsafe_code)]
#![allow(clippy::default_trait_access, clippy::cognitive_complexity)]

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod capture;
pub mod cli;
pub mod cmdline;
pub mod config;
pub mod container;
pub mod error;
mod interrupt;
pub mod java;
pub mod launch;
pub mod options;
pub mod pipe;
pub mod run;
pub mod shutdown;
pub mod supervisor;

pub use run::run;

/// Locks a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
