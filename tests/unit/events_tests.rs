//! Event log sink behaviour.

use std::{os::unix::fs::PermissionsExt, path::Path, sync::Arc, thread};

use compatfs::fs::events::{create_event_file, read_events, EventLog, EventVerb, EVENT_FILE_PREFIX};
use tempfile::tempdir;

#[test]
fn disabled_log_ignores_events() {
    let log = EventLog::disabled();
    log.record(EventVerb::Open, Path::new("/etc/hosts"), Some(3));
    assert!(!log.is_enabled());
    assert_eq!(log.events_written(), 0);
    assert!(log.publish().is_ok());
}

#[test]
fn file_is_created_on_first_event_and_published_at_the_end() -> compatfs::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let log = EventLog::to_file(&path);
    assert!(!path.exists(), "sink must open lazily");

    log.record(EventVerb::Lookup, Path::new("/srv/data/app.bin"), None);
    log.record(EventVerb::Open, Path::new("/srv/data/app.bin"), Some(7));
    log.record(EventVerb::Close, Path::new("/srv/data/app.bin"), Some(7));

    let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);

    log.publish()?;
    let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o644);

    let events = read_events(&path)?;
    let verbs: Vec<_> = events.iter().map(|e| e.verb).collect();
    assert_eq!(verbs, vec![EventVerb::Lookup, EventVerb::Open, EventVerb::Close]);
    assert_eq!(events[1].correlation, Some(7));
    assert_eq!(events[2].correlation, Some(7));
    assert_eq!(events[0].subject, "/srv/data/app.bin");
    assert_eq!(log.events_written(), 3);
    Ok(())
}

#[test]
fn lines_use_a_fixed_width_verb_column() -> compatfs::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let log = EventLog::to_file(&path);
    log.record_str(EventVerb::Complete, "/bin/true", Some(0));

    let contents = std::fs::read_to_string(&path)?;
    let line = contents.lines().next().expect("one line");
    let (_, rest) = line.split_once(' ').expect("timestamp");
    assert_eq!(rest, "Complete   /bin/true 0");
    assert!(contents.ends_with('\n'));
    Ok(())
}

#[test]
fn concurrent_writers_never_interleave_lines() -> compatfs::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let log = Arc::new(EventLog::to_file(&path));

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let subject = format!("/data/t{t}/f{i}");
                    log.record(EventVerb::Open, Path::new(&subject), Some(i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("writer thread");
    }

    let contents = std::fs::read_to_string(&path)?;
    assert_eq!(contents.lines().count(), 800);
    let events = read_events(&path)?;
    assert_eq!(events.len(), 800);
    assert!(events
        .windows(2)
        .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    Ok(())
}

#[test]
fn unopenable_sink_does_not_fail_callers() {
    let log = EventLog::to_file("/nonexistent-dir/for/events.log");
    log.record(EventVerb::Open, Path::new("/a"), Some(1));
    log.record(EventVerb::Close, Path::new("/a"), Some(1));
    assert_eq!(log.events_written(), 0);
}

#[test]
fn generated_event_files_are_unique() -> compatfs::Result<()> {
    let dir = tempdir()?;
    let first = create_event_file(Some(dir.path()))?;
    let second = create_event_file(Some(dir.path()))?;
    assert_ne!(first, second);
    for path in [&first, &second] {
        assert!(path.exists());
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with(EVENT_FILE_PREFIX));
    }
    Ok(())
}
