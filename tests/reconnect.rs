//! Session continuity across transport reconnects.

use keybus::{
    BusError, Connection, InProcessConnection, RetentionConfig, SessionState, Topic,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn pair(
    topic: &Topic<String, String>,
    writer_config: RetentionConfig,
) -> (keybus::Writer<String, String>, keybus::Reader<String, String>) {
    let writer = topic
        .single_key_writer("k".into(), Some("w"), writer_config)
        .unwrap();
    let reader = topic
        .single_key_reader("k".into(), Some("r"), RetentionConfig::default())
        .unwrap();
    (writer, reader)
}

fn values(samples: &[keybus::Sample<String, String>]) -> Vec<String> {
    samples
        .iter()
        .map(|s| s.value.clone().unwrap_or_default())
        .collect()
}

// --- Transport loss ---

#[test]
fn test_connection_close_transitions_session() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();
    assert_eq!(
        topic.session_state(writer.id(), reader.id()),
        Some(SessionState::Connected)
    );

    conn.close();
    assert_eq!(
        topic.session_state(writer.id(), reader.id()),
        Some(SessionState::Disconnected)
    );
}

#[test]
fn test_unread_queue_survives_transport_loss() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();

    writer.add("a".into()).unwrap();
    writer.update("b".into()).unwrap();
    conn.close();

    // The transport dropped; nothing already delivered is discarded.
    assert_eq!(reader.unread_count(), 2);
    assert_eq!(values(&reader.get_all_unread()), vec!["a", "b"]);
}

#[test]
fn test_publish_while_disconnected_is_buffered_not_rejected() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();
    conn.close();

    writer.add("offline".into()).unwrap();
    assert_eq!(reader.unread_count(), 0);
    // Retained on the writer side, waiting for replay.
    assert_eq!(writer.get_all().unwrap().len(), 1);
}

// --- Reconnect and replay ---

#[test]
fn test_reconnect_replays_from_cursor() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();

    writer.add("before".into()).unwrap();
    conn.close();
    writer.update("during1".into()).unwrap();
    writer.update("during2".into()).unwrap();

    let conn2 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn2).unwrap();

    // "before" was delivered pre-disconnect; replay picks up exactly the
    // samples published while the transport was down.
    assert_eq!(
        values(&reader.get_all_unread()),
        vec!["before", "during1", "during2"]
    );
    assert_eq!(reader.evicted_gap_count(), 0);
}

#[test]
fn test_replay_skips_evicted_samples_and_counts_the_gap() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(
        &topic,
        RetentionConfig::default().with_sample_count(2),
    );

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();

    writer.add("a".into()).unwrap();
    conn.close();
    for i in 0..5 {
        writer.update(format!("d{i}")).unwrap();
    }

    let conn2 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn2).unwrap();

    // Sequences 2..4 fell off the bounded writer history while disconnected.
    // The gap is silent in the sample stream but visible in the counters.
    assert_eq!(values(&reader.get_all_unread()), vec!["a", "d3", "d4"]);
    assert_eq!(reader.evicted_gap_count(), 3);
    assert_eq!(writer.evicted_count().unwrap(), 4);
}

#[test]
fn test_reconnect_storm_is_idempotent() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();

    writer.add("a".into()).unwrap();
    writer.update("b".into()).unwrap();
    conn.close();

    // Two reconnect cycles with no writer activity in between.
    for _ in 0..2 {
        let conn = InProcessConnection::new();
        topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();
        conn.close();
    }

    // No duplicates, no reordering, no loss.
    assert_eq!(reader.unread_count(), 2);
    assert_eq!(values(&reader.get_all_unread()), vec!["a", "b"]);
    assert_eq!(reader.evicted_gap_count(), 0);
}

#[test]
fn test_stale_close_from_replaced_connection_is_ignored() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn1 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn1.clone()).unwrap();

    let conn2 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn2).unwrap();

    // conn1 was already replaced; its close must not take the session down.
    conn1.close();
    assert_eq!(
        topic.session_state(writer.id(), reader.id()),
        Some(SessionState::Connected)
    );
}

#[test]
fn test_binding_an_already_closed_connection() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let conn = InProcessConnection::new();
    conn.close();
    topic.bind_session(writer.id(), reader.id(), conn).unwrap();

    // The close notification fires on registration.
    assert_eq!(
        topic.session_state(writer.id(), reader.id()),
        Some(SessionState::Disconnected)
    );
}

// --- Replay and callbacks ---

#[test]
fn test_replayed_samples_arrive_as_a_batch() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let singles = Arc::new(AtomicUsize::new(0));

    let b = Arc::clone(&batches);
    let s = Arc::clone(&singles);
    reader.on_samples(
        Box::new(move |batch| {
            b.lock().unwrap().push(values(batch));
        }),
        Box::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();

    writer.add("live".into()).unwrap();
    assert_eq!(singles.load(Ordering::SeqCst), 1);

    conn.close();
    writer.update("offline1".into()).unwrap();
    writer.update("offline2".into()).unwrap();

    let conn2 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn2).unwrap();

    let got = batches.lock().unwrap().clone();
    assert_eq!(got, vec![vec!["offline1".to_string(), "offline2".to_string()]]);
    assert_eq!(singles.load(Ordering::SeqCst), 1);
}

// --- Membership waits during reconnect ---

#[test]
fn test_disconnected_writer_leaves_connected_set() {
    let topic: Topic<String, String> = Topic::new("t");
    let (writer, reader) = pair(&topic, RetentionConfig::default());

    assert_eq!(reader.connected_writers(), vec!["w".to_string()]);

    let conn = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn.clone()).unwrap();
    conn.close();

    assert!(reader.connected_writers().is_empty());
    assert!(reader.wait_for_no_writers(Some(Duration::from_millis(100))));

    let conn2 = InProcessConnection::new();
    topic.bind_session(writer.id(), reader.id(), conn2).unwrap();
    assert!(reader.wait_for_writers(1, Some(Duration::from_millis(100))));
}

#[test]
fn test_pull_after_topic_close_reports_closed() {
    let topic: Topic<String, String> = Topic::new("t");
    let (_writer, reader) = pair(&topic, RetentionConfig::default());

    topic.close();
    assert!(matches!(reader.next_unread(None), Err(BusError::Closed)));
}
