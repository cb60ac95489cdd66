//! Output capture: the child's stdout and stderr, line by line, into an
//! [`EventSink`].
//!
//! Each stream gets its own reader thread. Lines are classified by their
//! log4j level prefix, blank lines are dropped, and very long lines are cut
//! to fit the sink's record size. Nothing that goes wrong with a single line
//! stops the reader.

use std::{
    borrow::Cow,
    fmt,
    io::{self, BufRead, BufReader, Read},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crate::lock;

/// Longest record forwarded to a sink, in characters.
pub const MAX_RECORD_CHARS: usize = 32000;

/// Appended to records cut at [`MAX_RECORD_CHARS`].
pub const TRUNCATION_MARKER: &str = " [TRUNCATED]";

/// Importance of a line of server output.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Severity {
    Verbose,
    Information,
    Warning,
    Error,
}

impl Severity {
    pub const fn log_level(self) -> log::Level {
        match self {
            Self::Verbose => log::Level::Debug,
            Self::Information => log::Level::Info,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verbose => "verbose",
            Self::Information => "information",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// log4j level prefixes, checked in order.
pub static LEVEL_PREFIXES: &[(&str, Severity)] = &[
    ("TRACE ", Severity::Verbose),
    ("DEBUG ", Severity::Verbose),
    ("INFO ", Severity::Information),
    ("WARN ", Severity::Warning),
    ("ERROR ", Severity::Error),
    ("FATAL ", Severity::Error),
];

/// The severity a line announces, or `default` if it has no level prefix.
pub fn classify(line: &str, default: Severity) -> Severity {
    LEVEL_PREFIXES
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .map_or(default, |&(_, severity)| severity)
}

/// Cuts `line` to [`MAX_RECORD_CHARS`] characters, marking it if it was cut.
pub fn truncate_record(line: &str) -> Cow<'_, str> {
    match line.char_indices().nth(MAX_RECORD_CHARS) {
        None => Cow::Borrowed(line),
        Some((end, _)) => {
            let mut cut = String::with_capacity(end + TRUNCATION_MARKER.len());
            cut.push_str(&line[..end]);
            cut.push_str(TRUNCATION_MARKER);
            Cow::Owned(cut)
        }
    }
}

/// Error reported by a sink that could not record an event.
#[derive(Debug)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SinkError {}

/// Where classified output goes: an event log, syslog, a file.
pub trait EventSink: Send {
    fn emit(&mut self, text: &str, severity: Severity) -> Result<(), SinkError>;
}

/// A sink shared by both reader threads; every emit happens under its lock.
pub type SharedSink = Arc<Mutex<dyn EventSink>>;

/// Wraps a sink for sharing between readers.
pub fn shared<S: EventSink + 'static>(sink: S) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// Forwards server output to the `log` facade under the `server` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, text: &str, severity: Severity) -> Result<(), SinkError> {
        log!(target: "server", severity.log_level(), "{}", text);
        Ok(())
    }
}

/// Lines of a byte stream, as an iterator.
///
/// Line endings (`\n` or `\r\n`) are stripped and invalid UTF-8 is replaced.
/// The iterator ends at end-of-stream, and after yielding a read error.
#[derive(Debug)]
pub struct Lines<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> Lines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for Lines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                if self.buf.ends_with(b"\n") {
                    self.buf.pop();
                    if self.buf.ends_with(b"\r") {
                        self.buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&self.buf).into_owned()))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Classifies one line and hands it to the sink. Never fails: problems are
/// logged and the line is dropped.
pub fn forward(sink: &Mutex<dyn EventSink>, line: &str, default: Severity) {
    if line.trim().is_empty() {
        return;
    }

    let record = truncate_record(line);
    let severity = classify(&record, default);
    // a poisoned sink is recovered by the next lock
    match panic::catch_unwind(AssertUnwindSafe(|| lock(sink).emit(&record, severity))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Failed to write event ({}): {}", severity, err),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown cause");
            error!("Event sink panicked ({}): {}", severity, reason);
        }
    }
}

/// Drains `reader` until end-of-stream on a thread of its own.
pub fn spawn_reader<R>(
    name: &str,
    reader: R,
    default: Severity,
    sink: SharedSink,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let stream = name.to_owned();
    thread::Builder::new()
        .name(format!("capture-{}", name))
        .spawn(move || {
            debug!("Capturing child {}", stream);
            for line in Lines::new(BufReader::new(reader)) {
                match line {
                    Ok(line) => forward(&sink, &line, default),
                    Err(err) => {
                        error!("Unexpected error reading child {}: {}", stream, err);
                        forward(
                            &sink,
                            &format!("Unexpected error reading pipe: {}", err),
                            Severity::Error,
                        );
                        break;
                    }
                }
            }
            debug!("Child {} closed", stream);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Default)]
    struct Recorder(Vec<(String, Severity)>);

    impl EventSink for Recorder {
        fn emit(&mut self, text: &str, severity: Severity) -> Result<(), SinkError> {
            self.0.push((text.to_owned(), severity));
            Ok(())
        }
    }

    struct Broken(usize);

    impl EventSink for Broken {
        fn emit(&mut self, _: &str, _: Severity) -> Result<(), SinkError> {
            self.0 += 1;
            Err(SinkError("event log is full".into()))
        }
    }

    #[test]
    fn classification_follows_prefix_table() {
        let info = Severity::Information;
        assert_eq!(classify("TRACE x", info), Severity::Verbose);
        assert_eq!(classify("DEBUG x", info), Severity::Verbose);
        assert_eq!(classify("INFO Server started", Severity::Error), Severity::Information);
        assert_eq!(classify("WARN disk", info), Severity::Warning);
        assert_eq!(classify("ERROR boom", info), Severity::Error);
        assert_eq!(classify("FATAL boom", info), Severity::Error);
    }

    #[test]
    fn classification_falls_back_to_default() {
        assert_eq!(classify("Starting", Severity::Information), Severity::Information);
        assert_eq!(classify("Exception in thread", Severity::Error), Severity::Error);
        assert_eq!(classify("info lower case", Severity::Error), Severity::Error);
        assert_eq!(classify("INFO", Severity::Error), Severity::Error);
        assert_eq!(classify(" INFO indented", Severity::Warning), Severity::Warning);
        assert_eq!(classify("INFORMATION x", Severity::Error), Severity::Error);
    }

    #[test]
    fn short_lines_are_verbatim() {
        let line = "x".repeat(MAX_RECORD_CHARS);
        assert!(matches!(truncate_record(&line), Cow::Borrowed(_)));
        assert_eq!(truncate_record("INFO hi"), "INFO hi");
    }

    #[test]
    fn long_lines_are_cut_and_marked() {
        let line = "y".repeat(MAX_RECORD_CHARS + 10);
        let cut = truncate_record(&line);
        assert_eq!(cut.len(), MAX_RECORD_CHARS + TRUNCATION_MARKER.len());
        assert!(cut.ends_with(" [TRUNCATED]"));
        assert!(cut.starts_with("yyyy"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let line = "é".repeat(MAX_RECORD_CHARS + 1);
        let cut = truncate_record(&line);
        assert_eq!(
            cut.chars().count(),
            MAX_RECORD_CHARS + TRUNCATION_MARKER.chars().count()
        );

        let fits = "é".repeat(MAX_RECORD_CHARS);
        assert_eq!(truncate_record(&fits), fits.as_str());
    }

    #[test]
    fn lines_strip_endings_and_replace_bad_utf8() {
        let input = Cursor::new(b"one\r\ntwo\n\xffthree".to_vec());
        let lines: Vec<String> = Lines::new(input).map(Result::unwrap).collect();
        assert_eq!(lines, vec!["one", "two", "\u{fffd}three"]);
    }

    #[test]
    fn lines_stop_after_error() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
        }

        let mut lines = Lines::new(BufReader::new(Failing));
        assert!(matches!(lines.next(), Some(Err(_))));
        assert!(lines.next().is_none());
    }

    #[test]
    fn forward_drops_blank_lines() {
        let sink = Mutex::new(Recorder::default());
        forward(&sink, "", Severity::Information);
        forward(&sink, "  \t ", Severity::Information);
        forward(&sink, "INFO Server started", Severity::Information);
        forward(&sink, "ERROR boom", Severity::Error);
        let recorder = sink.into_inner().unwrap();
        assert_eq!(
            recorder.0,
            vec![
                ("INFO Server started".to_owned(), Severity::Information),
                ("ERROR boom".to_owned(), Severity::Error),
            ]
        );
    }

    #[test]
    fn sink_failures_do_not_stop_forwarding() {
        let sink = Mutex::new(Broken(0));
        forward(&sink, "first", Severity::Information);
        forward(&sink, "second", Severity::Information);
        assert_eq!(sink.into_inner().unwrap().0, 2);
    }

    #[test]
    fn panicking_sink_does_not_stop_the_reader() {
        struct Flaky(Vec<String>);
        impl EventSink for Flaky {
            fn emit(&mut self, text: &str, _: Severity) -> Result<(), SinkError> {
                if text == "first" {
                    panic!("sink blew up on {}", text);
                }
                self.0.push(text.to_owned());
                Ok(())
            }
        }

        let flaky = Arc::new(Mutex::new(Flaky(Vec::new())));
        let sink: SharedSink = flaky.clone();
        let input = Cursor::new(b"first\nsecond\nthird\n".to_vec());
        spawn_reader("stdout", input, Severity::Information, sink)
            .unwrap()
            .join()
            .expect("reader thread survives");

        let got = crate::lock(&flaky).0.clone();
        assert_eq!(got, ["second", "third"]);
    }

    #[test]
    fn reader_thread_drains_to_eof() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let sink: SharedSink = recorder.clone();
        let input = Cursor::new(b"INFO up\n\nplain\nWARN low disk\n".to_vec());
        spawn_reader("stdout", input, Severity::Information, sink)
            .unwrap()
            .join()
            .unwrap();

        let got = recorder.lock().unwrap().0.clone();
        assert_eq!(
            got,
            vec![
                ("INFO up".to_owned(), Severity::Information),
                ("plain".to_owned(), Severity::Information),
                ("WARN low disk".to_owned(), Severity::Warning),
            ]
        );
    }

    #[test]
    fn reader_thread_reports_read_errors() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "pipe broke"))
            }
        }

        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let sink: SharedSink = recorder.clone();
        spawn_reader("stderr", Failing, Severity::Error, sink)
            .unwrap()
            .join()
            .unwrap();

        let got = recorder.lock().unwrap().0.clone();
        assert_eq!(got.len(), 1);
        assert!(got[0].0.starts_with("Unexpected error reading pipe: "));
        assert_eq!(got[0].1, Severity::Error);
    }
}
