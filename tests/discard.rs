//! Discard arbitration between competing writers and overloaded readers.

use keybus::{DiscardPolicy, RetentionConfig, Topic};

fn values(samples: &[keybus::Sample<String, String>]) -> Vec<String> {
    samples
        .iter()
        .map(|s| s.value.clone().unwrap_or_default())
        .collect()
}

#[test]
fn test_priority_reader_sees_only_highest_priority_writer() {
    let topic: Topic<String, String> = Topic::new("sensors");
    let high = topic
        .single_key_writer(
            "pressure".into(),
            Some("high"),
            RetentionConfig::default().with_priority(10),
        )
        .unwrap();
    let low = topic
        .single_key_writer(
            "pressure".into(),
            Some("low"),
            RetentionConfig::default().with_priority(1),
        )
        .unwrap();
    let reader = topic
        .single_key_reader(
            "pressure".into(),
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::Priority),
        )
        .unwrap();

    high.add("h1".into()).unwrap();
    low.add("l1".into()).unwrap();
    high.update("h2".into()).unwrap();
    low.update("l2".into()).unwrap();

    let got = reader.get_all_unread();
    assert_eq!(values(&got), vec!["h1", "h2"]);
}

#[test]
fn test_priority_failover_admits_next_highest_without_replay() {
    let topic: Topic<String, String> = Topic::new("sensors");
    let high = topic
        .single_key_writer(
            "k".into(),
            Some("high"),
            RetentionConfig::default().with_priority(10),
        )
        .unwrap();
    let low = topic
        .single_key_writer(
            "k".into(),
            Some("low"),
            RetentionConfig::default().with_priority(1),
        )
        .unwrap();
    let reader = topic
        .single_key_reader(
            "k".into(),
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::Priority),
        )
        .unwrap();

    high.add("h1".into()).unwrap();
    low.add("l1".into()).unwrap();
    drop(high);
    low.update("l2".into()).unwrap();

    // The dropped l1 is gone for good; only samples published after the
    // failover flow through.
    let got = reader.get_all_unread();
    assert_eq!(values(&got), vec!["h1", "l2"]);
}

#[test]
fn test_send_time_coalesces_to_last_value_when_reader_idles() {
    let topic: Topic<String, String> = Topic::new("ticks");
    let writer = topic
        .single_key_writer("t".into(), None, RetentionConfig::default())
        .unwrap();
    let reader = topic
        .single_key_reader(
            "t".into(),
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::SendTime),
        )
        .unwrap();

    for i in 0..50 {
        writer.update(format!("v{i}")).unwrap();
    }

    // No consumption happened: only the newest sample survives.
    assert_eq!(reader.unread_count(), 1);
    let got = reader.get_all_unread();
    assert_eq!(values(&got), vec!["v49"]);
}

#[test]
fn test_send_time_delivery_is_strictly_increasing() {
    let topic: Topic<String, String> = Topic::new("ticks");
    let writer = topic
        .single_key_writer("t".into(), None, RetentionConfig::default())
        .unwrap();
    let reader = topic
        .single_key_reader(
            "t".into(),
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::SendTime),
        )
        .unwrap();

    let mut consumed = Vec::new();
    for round in 0..20 {
        // Publish faster than we consume.
        for burst in 0..3 {
            writer.update(format!("r{round}b{burst}")).unwrap();
        }
        if let Some(sample) = reader.next_unread(None).unwrap() {
            consumed.push(sample);
        }
    }
    consumed.extend(reader.get_all_unread());

    assert!(consumed.len() < 60, "coalescing must drop stale samples");
    for pair in consumed.windows(2) {
        assert!(
            pair[1].timestamp > pair[0].timestamp,
            "observed timestamps must strictly increase"
        );
    }
}

#[test]
fn test_none_policy_delivers_every_sample_per_writer_in_order() {
    let topic: Topic<String, String> = Topic::new("plain");
    let writer = topic
        .single_key_writer("k".into(), None, RetentionConfig::default())
        .unwrap();
    let reader = topic
        .single_key_reader("k".into(), None, RetentionConfig::default())
        .unwrap();

    for i in 0..10 {
        writer.update(format!("v{i}")).unwrap();
    }

    let got = reader.get_all_unread();
    let expected: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
    assert_eq!(values(&got), expected);
}

#[test]
fn test_priority_state_rebuilds_after_reader_recreation() {
    let topic: Topic<String, String> = Topic::new("sensors");
    let low = topic
        .single_key_writer(
            "k".into(),
            Some("low"),
            RetentionConfig::default().with_priority(1),
        )
        .unwrap();

    {
        let high = topic
            .single_key_writer(
                "k".into(),
                Some("high"),
                RetentionConfig::default().with_priority(10),
            )
            .unwrap();
        high.add("h1".into()).unwrap();
    }

    // The high writer is gone; a fresh reader arbitrates against the
    // writers it actually observes.
    let reader = topic
        .single_key_reader(
            "k".into(),
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::Priority),
        )
        .unwrap();
    low.update("l1".into()).unwrap();

    let got = reader.get_all_unread();
    assert_eq!(values(&got), vec!["h1", "l1"]);
}
