#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use oie_launcher::{
    capture::{EventSink, Severity, SharedSink, SinkError},
    supervisor::Invocation,
};

/// Keeps every event it is given.
#[derive(Clone, Default)]
pub struct RecordingSink(Arc<Mutex<Vec<(String, Severity)>>>);

impl RecordingSink {
    pub fn shared(&self) -> SharedSink {
        Arc::new(Mutex::new(self.clone()))
    }

    pub fn events(&self) -> Vec<(String, Severity)> {
        self.0.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.events().into_iter().map(|(text, _)| text).collect()
    }

    /// Polls until an event with exactly this text arrives.
    pub fn wait_for(&self, text: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.texts().iter().any(|t| t == text) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, text: &str, severity: Severity) -> Result<(), SinkError> {
        self.0.lock().unwrap().push((text.to_owned(), severity));
        Ok(())
    }
}

/// Runs `script` with `/bin/sh -c` in the temp dir.
pub fn sh(script: &str) -> Invocation {
    Invocation {
        command: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), script.into()],
        working_dir: std::env::temp_dir(),
    }
}

pub fn init_logger() {
    env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init()
        .ok();
}
