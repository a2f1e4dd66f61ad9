use criterion::{criterion_group, criterion_main, Criterion};
use quire_sync::cache::{LocalCache, RocksCache};
use quire_sync::feed::FeedHub;
use quire_sync::presence::{CursorColor, PresenceState, TextCursor};
use quire_sync::protocol::{FeedMessage, Table};
use quire_sync::provider::OfflineQueue;
use quire_sync::replica::Replica;
use quire_sync::storage::{MemoryStore, RocksStore, StoreConfig, SyncStore};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ─── Wire benchmarks ────────────────────────────────────────────

fn bench_feed_message_encode(c: &mut Criterion) {
    let msg = FeedMessage::Update { seq: 42, payload: vec![0u8; 64] };

    c.bench_function("feed_update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_feed_message_decode(c: &mut Criterion) {
    let encoded = FeedMessage::Update { seq: 42, payload: vec![0u8; 64] }.encode().unwrap();

    c.bench_function("feed_update_decode_64B", |b| {
        b.iter(|| black_box(FeedMessage::decode(black_box(&encoded)).unwrap()))
    });
}

// ─── Replica benchmarks ─────────────────────────────────────────

fn bench_replica_local_edit(c: &mut Criterion) {
    c.bench_function("replica_push_100_edits", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for _ in 0..100 {
                black_box(replica.push("word ").unwrap());
            }
        })
    });
}

fn bench_replica_replay_log(c: &mut Criterion) {
    let mut source = Replica::new();
    let log: Vec<Vec<u8>> = (0..1000)
        .filter_map(|i| source.push(&format!("{} ", i % 10)).unwrap())
        .collect();

    c.bench_function("replica_replay_1000_updates", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for update in &log {
                replica.merge(black_box(update)).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_replica_snapshot(c: &mut Criterion) {
    let mut replica = Replica::new();
    for i in 0..1000 {
        replica.push(&format!("line {i}\n")).unwrap();
    }

    c.bench_function("replica_encode_state_1000_edits", |b| {
        b.iter(|| black_box(replica.encode_state()))
    });
}

// ─── Presence benchmarks ────────────────────────────────────────

fn bench_presence_encode(c: &mut Criterion) {
    let state = PresenceState::new(Uuid::new_v4(), "Alice").with_cursor(TextCursor { anchor: 10, head: 42 });

    c.bench_function("presence_state_encode", |b| {
        b.iter(|| black_box(black_box(&state).encode().unwrap()))
    });
}

fn bench_cursor_color_from_uuid(c: &mut Criterion) {
    let id = Uuid::new_v4();

    c.bench_function("cursor_color_from_uuid", |b| {
        b.iter(|| black_box(CursorColor::from_client_id(black_box(id))))
    });
}

// ─── Client queue benchmarks ────────────────────────────────────

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for _ in 0..1000u64 {
                queue.enqueue(vec![0u8; 64]);
            }
            while let Some(payload) = queue.pop_front() {
                black_box(payload);
            }
        })
    });
}

// ─── Fan-out benchmarks ─────────────────────────────────────────

fn bench_feed_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("feed_append_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = FeedHub::new(Arc::new(MemoryStore::new()), 1024, Duration::from_secs(30));
                let doc = Uuid::new_v4();

                let mut subscribers = Vec::new();
                for _ in 0..100 {
                    subscribers.push(hub.subscribe(doc, Table::DocumentUpdates, 0).await.unwrap());
                }
                let seq = hub.append_update(doc, black_box(&[7u8; 64])).await.unwrap();
                black_box(seq);
            });
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────────

fn bench_rocks_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("quire_bench_append_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let doc = Uuid::new_v4();
    let update = vec![42u8; 256];

    c.bench_function("rocks_append_update_256B", |b| {
        b.iter(|| black_box(store.append_update(black_box(doc), black_box(&update)).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_updates_since(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("quire_bench_replay_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let doc = Uuid::new_v4();
    for _ in 0..1000 {
        store.append_update(doc, &[42u8; 128]).unwrap();
    }

    c.bench_function("rocks_updates_since_1000_rows", |b| {
        b.iter(|| black_box(store.updates_since(black_box(doc), 0).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_cache_store(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("quire_bench_cache_{}", Uuid::new_v4()));
    let cache = RocksCache::open(&dir).unwrap();
    let doc = Uuid::new_v4();
    let mut replica = Replica::new();
    for i in 0..500 {
        replica.push(&format!("line {i}\n")).unwrap();
    }
    let snapshot = replica.encode_state();

    c.bench_function("cache_store_snapshot", |b| {
        b.iter(|| cache.store(black_box(doc), black_box(&snapshot)).unwrap())
    });

    drop(cache);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_feed_message_encode,
    bench_feed_message_decode,
    bench_replica_local_edit,
    bench_replica_replay_log,
    bench_replica_snapshot,
    bench_presence_encode,
    bench_cursor_color_from_uuid,
    bench_offline_queue,
    bench_feed_fanout,
    bench_rocks_append,
    bench_rocks_updates_since,
    bench_cache_store,
);
criterion_main!(benches);
