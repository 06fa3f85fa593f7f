use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracker_sync::{
    CacheStore, DomainEvent, EventDispatcher, EventKind, Frame, FeedConfig, NotificationFeed,
    ReconcileConfig, ReconciliationEngine, Scope, WorkspaceRoom, WorkspaceRooms,
};
use tracker_sync::dispatcher::CommittedChange;
use uuid::Uuid;

fn status_event(i: usize) -> DomainEvent {
    DomainEvent::new(
        EventKind::ResourceStatusChanged,
        Scope::new("P1", format!("I-{}", i % 50)),
        json!({ "status": "in_progress" }),
    )
}

fn bench_event_encode(c: &mut Criterion) {
    let event = status_event(7);

    c.bench_function("event_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = status_event(7).encode().unwrap();

    c.bench_function("frame_decode", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_reconcile_burst(c: &mut Criterion) {
    let events: Vec<DomainEvent> = (0..1000).map(status_event).collect();

    c.bench_function("reconcile_1000_events_50_resources", |b| {
        b.iter(|| {
            let mut engine = ReconciliationEngine::new(ReconcileConfig::default(), CacheStore::new());
            let now = Instant::now();
            for event in &events {
                engine.ingest(event, false, now);
            }
            black_box(engine.flush_due(now + Duration::from_millis(100)));
        })
    });
}

fn bench_feed_at_capacity(c: &mut Criterion) {
    let events: Vec<DomainEvent> = (0..200).map(status_event).collect();

    c.bench_function("feed_push_200_capacity_50", |b| {
        b.iter(|| {
            let mut feed = NotificationFeed::new(FeedConfig::default());
            for event in &events {
                feed.push(event);
            }
            black_box(feed.len());
        })
    });
}

fn bench_room_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_publish_1000_frames_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = WorkspaceRoom::new(2048);
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(room.add_session(Uuid::new_v4()).await);
                }

                let frame: Arc<str> = Arc::from(status_event(1).encode().unwrap());
                for _ in 0..1000 {
                    room.publish(black_box(frame.clone()));
                }
            });
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("dispatch_to_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let rooms = Arc::new(WorkspaceRooms::new(1024));
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(rooms.join(&"P1".into(), Uuid::new_v4()).await);
                }
                let dispatcher = EventDispatcher::new(rooms);
                let change = CommittedChange::new(
                    EventKind::ResourceStatusChanged,
                    Scope::new("P1", "I-1"),
                    json!({ "status": "done" }),
                );
                black_box(dispatcher.dispatch(change).await.unwrap());
            });
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_frame_decode,
    bench_reconcile_burst,
    bench_feed_at_capacity,
    bench_room_fan_out,
    bench_dispatch,
);

criterion_main!(benches);
