//! Performance benchmarks for the bus.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keybus::{
    ClearHistoryPolicy, DiscardPolicy, HistoryStore, RetentionConfig, SampleEvent, SessionId,
    Timestamp, Topic,
};

/// Benchmark raw history appends under each clear policy
fn bench_history_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_append");

    for (label, policy) in [
        ("never", ClearHistoryPolicy::Never),
        ("on_add", ClearHistoryPolicy::OnAdd),
        ("on_all", ClearHistoryPolicy::OnAll),
    ] {
        group.bench_with_input(BenchmarkId::new("policy", label), &policy, |b, &policy| {
            let mut store: HistoryStore<u64, u64> = HistoryStore::new(
                RetentionConfig::default()
                    .with_clear_history(policy)
                    .with_sample_count(1000),
            );
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                black_box(store.publish(
                    1,
                    SampleEvent::Update,
                    Some(i),
                    None,
                    SessionId(1),
                    0,
                    Timestamp(i as i64),
                ));
            });
        });
    }

    group.finish();
}

/// Benchmark publish-route-consume round trips with varying reader counts
fn bench_publish_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_route");

    for readers in [1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("readers", readers),
            &readers,
            |b, &readers| {
                let topic: Topic<u64, u64> = Topic::new("bench");
                let writer = topic
                    .single_key_writer(1, None, RetentionConfig::default().with_sample_count(16))
                    .unwrap();
                let handles: Vec<_> = (0..readers)
                    .map(|_| {
                        topic
                            .single_key_reader(
                                1,
                                None,
                                RetentionConfig::default().with_sample_count(16),
                            )
                            .unwrap()
                    })
                    .collect();

                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    writer.update(i).unwrap();
                    for reader in &handles {
                        black_box(reader.get_all_unread());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark send-time coalescing under an idle reader
fn bench_send_time_coalescing(c: &mut Criterion) {
    let topic: Topic<u64, u64> = Topic::new("bench");
    let writer = topic
        .single_key_writer(1, None, RetentionConfig::default().with_sample_count(64))
        .unwrap();
    let reader = topic
        .single_key_reader(
            1,
            None,
            RetentionConfig::default().with_discard_policy(DiscardPolicy::SendTime),
        )
        .unwrap();

    let mut i = 0u64;
    c.bench_function("send_time_coalescing", |b| {
        b.iter(|| {
            i += 1;
            black_box(writer.update(i).unwrap());
        });
    });

    // The idle reader holds only the newest unconsumed sample.
    assert!(reader.unread_count() <= 1);
}

criterion_group!(
    benches,
    bench_history_append,
    bench_publish_route,
    bench_send_time_coalescing,
);

criterion_main!(benches);
