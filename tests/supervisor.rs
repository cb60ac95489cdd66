#![cfg(unix)]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use oie_launcher::{
    capture::{Severity, MAX_RECORD_CHARS, TRUNCATION_MARKER},
    error::Error,
    launch::ExitStatus,
    supervisor::{Invocation, Supervisor},
};

mod helpers;
use helpers::{sh, RecordingSink};

const PATIENCE: Duration = Duration::from_secs(10);

/// A server that announces itself and exits cleanly when interrupted.
const WELL_BEHAVED: &str = r#"trap 'echo "INFO Shutting down"; exit 0' INT
echo "INFO Server started"
while :; do sleep 0.1; done"#;

fn exits_by_itself(script: &str) -> (RecordingSink, Supervisor, ExitStatus) {
    helpers::init_logger();
    let sink = RecordingSink::default();
    let (tx, rx) = mpsc::channel();
    let supervisor = Supervisor::start(&sh(script), sink.shared(), move |status| {
        tx.send(status).unwrap();
    })
    .unwrap();
    let status = rx.recv_timeout(PATIENCE).expect("server should exit by itself");
    (sink, supervisor, status)
}

#[test]
fn output_is_classified_per_stream() {
    let (sink, mut supervisor, status) = exits_by_itself(
        r#"echo "INFO Server started"
echo
echo "   "
echo "ERROR boom" >&2
echo "plain out"
echo "plain err" >&2
echo "WARN on stderr" >&2
exit 0"#,
    );
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(supervisor.stop().unwrap(), Some(ExitStatus::Exited(0)));

    let mut events = sink.events();
    events.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        events,
        vec![
            ("ERROR boom".to_string(), Severity::Error),
            ("INFO Server started".to_string(), Severity::Information),
            ("WARN on stderr".to_string(), Severity::Warning),
            ("plain err".to_string(), Severity::Error),
            ("plain out".to_string(), Severity::Information),
        ]
    );
}

#[test]
fn long_lines_are_truncated() {
    let (sink, mut supervisor, _) = exits_by_itself(&format!(
        "printf 'INFO %0{}d\\n' 0; echo 'INFO short'",
        MAX_RECORD_CHARS + 100
    ));
    supervisor.stop().unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 2);
    let (long, severity) = &events[0];
    assert_eq!(*severity, Severity::Information);
    assert_eq!(long.chars().count(), MAX_RECORD_CHARS + TRUNCATION_MARKER.len());
    assert!(long.ends_with(TRUNCATION_MARKER));
    assert_eq!(events[1].0, "INFO short");
}

#[test]
fn stop_interrupts_and_waits() {
    helpers::init_logger();
    let sink = RecordingSink::default();
    let mut supervisor = Supervisor::start(&sh(WELL_BEHAVED), sink.shared(), |status| {
        panic!("stop was requested, not an unsolicited exit ({})", status)
    })
    .unwrap();
    assert!(sink.wait_for("INFO Server started", PATIENCE));
    assert!(supervisor.is_running());

    let status = supervisor.stop().unwrap();
    assert_eq!(status, Some(ExitStatus::Exited(0)));
    assert!(sink.texts().contains(&"INFO Shutting down".to_string()));
    assert!(!supervisor.is_running());
    assert_eq!(supervisor.pid(), None);
}

#[test]
fn stop_twice_is_harmless() {
    helpers::init_logger();
    let sink = RecordingSink::default();
    let mut supervisor = Supervisor::start(&sh(WELL_BEHAVED), sink.shared(), |_| {}).unwrap();
    assert!(sink.wait_for("INFO Server started", PATIENCE));

    assert_eq!(supervisor.stop().unwrap(), Some(ExitStatus::Exited(0)));
    assert_eq!(supervisor.stop().unwrap(), None);

    let shutdowns = sink
        .texts()
        .into_iter()
        .filter(|text| text == "INFO Shutting down")
        .count();
    assert_eq!(shutdowns, 1);
}

#[test]
fn unsolicited_exit_is_reported_once() {
    helpers::init_logger();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let (tx, rx) = mpsc::channel();
    let sink = RecordingSink::default();
    let mut supervisor = Supervisor::start(&sh("exit 3"), sink.shared(), move |status| {
        counted.fetch_add(1, Ordering::SeqCst);
        tx.send(status).unwrap();
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), ExitStatus::Exited(3));
    assert_eq!(supervisor.stop().unwrap(), Some(ExitStatus::Exited(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_racing_an_unsolicited_exit() {
    helpers::init_logger();
    for _ in 0..25 {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let seen = reported.clone();
        let sink = RecordingSink::default();
        let mut supervisor = Supervisor::start(&sh("exit 5"), sink.shared(), move |status| {
            seen.lock().unwrap().push(status);
        })
        .unwrap();

        let status = supervisor.stop().unwrap();
        // an interrupt that lands before the exit kills the shell instead
        assert!(
            matches!(
                status,
                Some(ExitStatus::Exited(5)) | Some(ExitStatus::Signalled(2))
            ),
            "{:?}",
            status
        );

        let reported = reported.lock().unwrap();
        assert!(reported.len() <= 1, "{:?}", reported);
        if let Some(first) = reported.first() {
            assert_eq!(Some(*first), status);
        }
        assert!(!supervisor.is_running());
    }
}

#[test]
fn leftover_children_are_killed_on_stop() {
    helpers::init_logger();
    let sink = RecordingSink::default();
    // exits at once, leaving a grandchild holding stdout
    let mut supervisor = Supervisor::start(
        &sh(r#"sleep 300 &
echo "INFO Server started"
exit 0"#),
        sink.shared(),
        |_| {},
    )
    .unwrap();
    assert!(sink.wait_for("INFO Server started", PATIENCE));

    // the readers only finish once the grandchild is gone
    supervisor.stop().unwrap();
}

#[test]
fn dropping_kills_the_server() {
    helpers::init_logger();
    let sink = RecordingSink::default();
    let supervisor = Supervisor::start(
        &sh(r#"trap '' INT; echo "INFO Server started"; exec sleep 300"#),
        sink.shared(),
        |_| panic!("a kill on teardown is not an unsolicited exit"),
    )
    .unwrap();
    assert!(sink.wait_for("INFO Server started", PATIENCE));
    drop(supervisor);
}

#[test]
fn bad_executable_fails_start() {
    helpers::init_logger();
    let invocation = Invocation {
        command: PathBuf::from("/nonexistent/jre/bin/java"),
        args: vec!["-version".into()],
        working_dir: std::env::temp_dir(),
    };
    let sink = RecordingSink::default();
    let result = Supervisor::start(&invocation, sink.shared(), |_| panic!("nothing ran"));
    assert!(matches!(result, Err(Error::Os { .. })));
    assert!(sink.events().is_empty());
}

#[test]
fn bad_working_directory_fails_start() {
    helpers::init_logger();
    let invocation = Invocation {
        working_dir: PathBuf::from("/nonexistent/oie"),
        ..sh("echo 'INFO never'")
    };
    let sink = RecordingSink::default();
    let result = Supervisor::start(&invocation, sink.shared(), |_| panic!("nothing ran"));
    assert!(result.is_err());
    assert!(sink.events().is_empty());
}
