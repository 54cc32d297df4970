//! Forgiving event-stream parser and the event grouper.
//!
//! The input is the test runner's newline-delimited JSON: one event per
//! line. Anything that is not a JSON event is skipped without error.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::model::{TestEvent, TestGroup, FAIL};

/// Parse an event stream from a reader, skipping unrecognizable lines.
///
/// Lines not beginning with `{` and lines that fail to decode are dropped
/// silently. Zero recognized events yields an empty vector, not an error.
pub fn parse_lines<R: Read>(reader: R) -> Result<Vec<TestEvent>> {
    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(reader).lines() {
        let line = line?;
        // Windows encodes its logs with stray NUL characters which break
        // decoding entirely; stripping them is harmless.
        let line = line.replace('\0', "");
        let trimmed = line.trim_start();
        if !trimmed.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<TestEvent>(trimmed) {
            Ok(ev) => events.push(ev),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "dropped malformed event lines");
    }
    Ok(events)
}

/// Parse an event stream from a file path.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Vec<TestEvent>> {
    parse_lines(File::open(path)?)
}

/// Group events by test name, preserving first-seen order.
///
/// Package-level events (empty test name) are discarded. Each group's
/// status tracks the last event's action, its time bounds cover all of its
/// events, and its duration is the elapsed value of the last event (the
/// runner reports cumulative elapsed per transition, so summing would
/// double-count).
pub fn group_events(events: &[TestEvent]) -> Vec<TestGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<TestGroup> = Vec::new();

    for e in events {
        if e.test.is_empty() {
            continue;
        }
        let i = *index.entry(e.test.clone()).or_insert_with(|| {
            groups.push(TestGroup {
                test_name: e.test.clone(),
                test_order: 0,
                hidden: false,
                status: String::new(),
                start: e.time,
                end: e.time,
                duration: 0.0,
                events: Vec::new(),
            });
            groups.len() - 1
        });
        let g = &mut groups[i];
        let mut e = e.clone();
        e.output = e.output.trim().to_string();
        g.status = e.action.clone();
        g.duration = e.elapsed;
        if e.time < g.start {
            g.start = e.time;
        }
        if e.time > g.end {
            g.end = e.time;
        }
        g.events.push(e);
    }

    hide_ancestors(&mut groups, &index);
    groups
}

/// Mark ancestor groups hidden so subtests are not double-counted.
///
/// A name A is an ancestor of B when B begins with "A/"; there is no
/// explicit tree, only this derived prefix relation. A failing ancestor
/// whose direct children all report a non-fail status stays visible: its
/// failure is aggregate-only (e.g. setup or teardown attributed to the
/// parent name) and hiding it would swallow the signal.
fn hide_ancestors(groups: &mut [TestGroup], index: &HashMap<String, usize>) {
    let mut hide = vec![false; groups.len()];
    for (name, &i) in index {
        let prefix = format!("{name}/");
        let mut has_descendant = false;
        let mut failing_child = false;
        for (other, &j) in index {
            let Some(rest) = other.strip_prefix(&prefix) else {
                continue;
            };
            has_descendant = true;
            if !rest.contains('/') && groups[j].status == FAIL {
                failing_child = true;
            }
        }
        if !has_descendant {
            continue;
        }
        if groups[i].status == FAIL && !failing_child {
            // Veto: all direct children healthy, surface the aggregate
            // failure instead of hiding it.
            continue;
        }
        hide[i] = true;
    }
    for (g, h) in groups.iter_mut().zip(hide) {
        g.hidden = h;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ev(test: &str, action: &str, secs: i64, elapsed: f64) -> TestEvent {
        TestEvent {
            time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs),
            action: action.into(),
            package: "k8s.io/minikube/test/integration".into(),
            test: test.into(),
            elapsed,
            output: String::new(),
        }
    }

    #[test]
    fn parses_forgivingly() {
        let input = b"garbage line\n\
            {\"Time\":\"2026-03-01T12:00:00Z\",\"Action\":\"run\",\"Test\":\"TestA\"}\n\
            {not json\n\
            \x00{\"Time\":\"2026-03-01T12:00:01Z\",\"Action\":\"pass\",\"Test\":\"TestA\",\"Elapsed\":1.5}\n"
            .to_vec();
        let events = parse_lines(&input[..]).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, "pass");
        assert_eq!(events[1].elapsed, 1.5);
    }

    #[test]
    fn empty_input_is_empty_result() {
        let events = parse_lines(&b""[..]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let events = vec![
            ev("TestB", "run", 0, 0.0),
            ev("TestA", "run", 1, 0.0),
            ev("", "output", 1, 0.0),
            ev("TestB", "pass", 2, 2.0),
            ev("TestA", "fail", 3, 2.5),
        ];
        let groups = group_events(&events);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].test_name, "TestB");
        assert_eq!(groups[1].test_name, "TestA");
        assert_eq!(groups[0].status, "pass");
        assert_eq!(groups[1].status, "fail");
        // Every named event lands in exactly one group.
        let total: usize = groups.iter().map(|g| g.events.len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn duration_is_last_elapsed_not_sum() {
        let events = vec![
            ev("TestA", "run", 0, 0.0),
            ev("TestA", "output", 1, 3.0),
            ev("TestA", "pass", 2, 7.25),
        ];
        let groups = group_events(&events);
        assert_eq!(groups[0].duration, 7.25);
        assert_eq!(groups[0].start, events[0].time);
        assert_eq!(groups[0].end, events[2].time);
    }

    #[test]
    fn passing_ancestor_is_hidden() {
        let events = vec![
            ev("TestX", "run", 0, 0.0),
            ev("TestX/sub", "run", 1, 0.0),
            ev("TestX/sub", "fail", 2, 1.0),
            ev("TestX", "pass", 3, 2.0),
        ];
        let groups = group_events(&events);
        assert!(groups[0].hidden, "passing ancestor should be hidden");
        assert!(!groups[1].hidden);
    }

    #[test]
    fn failing_ancestor_with_failing_child_is_hidden() {
        let events = vec![
            ev("TestX", "run", 0, 0.0),
            ev("TestX/sub", "fail", 1, 1.0),
            ev("TestX", "fail", 2, 2.0),
        ];
        let groups = group_events(&events);
        assert!(groups[0].hidden, "child already reports the failure");
    }

    #[test]
    fn failing_ancestor_with_healthy_children_stays_visible() {
        let events = vec![
            ev("TestX", "run", 0, 0.0),
            ev("TestX/sub", "pass", 1, 1.0),
            ev("TestX/other", "skip", 2, 0.0),
            ev("TestX", "fail", 3, 2.0),
        ];
        let groups = group_events(&events);
        assert!(
            !groups[0].hidden,
            "aggregate-only failure must not be swallowed"
        );
    }

    #[test]
    fn prefix_without_separator_is_not_an_ancestor() {
        let events = vec![
            ev("TestX", "pass", 0, 1.0),
            ev("TestXYZ", "pass", 1, 1.0),
        ];
        let groups = group_events(&events);
        assert!(!groups[0].hidden);
        assert!(!groups[1].hidden);
    }
}
