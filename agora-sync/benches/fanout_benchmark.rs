use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use agora_sync::{
    ApplyResult, BroadcastDispatcher, ChangeKind, Connection, ConnectionRegistry, Frame, Model,
    ModelChanges, RecordingTransport, SpaceView,
};

fn sample_delta(space: Uuid, version: u64, entities: usize) -> Frame {
    let created = (0..entities)
        .map(|i| {
            serde_json::json!({
                "id": Uuid::new_v4(),
                "kind": "chat",
                "status": "active",
                "content": [format!("message {i}")],
            })
        })
        .collect();
    Frame::SpaceDelta {
        space,
        model: Model::Intentions,
        version,
        timestamp: 1_700_000_000_000,
        created,
        updated: vec![],
        deleted: vec![],
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = sample_delta(Uuid::new_v4(), 1, 10);

    c.bench_function("frame_encode_10_entities", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = sample_delta(Uuid::new_v4(), 1, 10).encode().unwrap();

    c.bench_function("frame_decode_10_entities", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_sse_rendering(c: &mut Criterion) {
    let frame = sample_delta(Uuid::new_v4(), 1, 10);

    c.bench_function("frame_to_sse_10_entities", |b| {
        b.iter(|| {
            black_box(black_box(&frame).to_sse().unwrap());
        })
    });
}

fn bench_fan_out_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let space = Uuid::new_v4();
    let frame = sample_delta(space, 1, 10);

    c.bench_function("fan_out_100_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = Arc::new(ConnectionRegistry::new());
                for _ in 0..100 {
                    registry
                        .register(Connection::new(
                            space,
                            None,
                            HashSet::new(),
                            Arc::new(RecordingTransport::new()),
                        ))
                        .await;
                }
                let dispatcher = BroadcastDispatcher::new(registry);
                let outcome = dispatcher.broadcast(black_box(&frame)).await.unwrap();
                black_box(outcome.delivered);
            });
        })
    });
}

fn bench_fan_out_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let space = Uuid::new_v4();

    c.bench_function("fan_out_1000_frames_10_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = Arc::new(ConnectionRegistry::new());
                for _ in 0..10 {
                    registry
                        .register(Connection::new(
                            space,
                            None,
                            HashSet::new(),
                            Arc::new(RecordingTransport::new()),
                        ))
                        .await;
                }
                let dispatcher = BroadcastDispatcher::new(registry);
                for version in 1..=1000u64 {
                    let frame = sample_delta(space, version, 1);
                    dispatcher.broadcast(black_box(&frame)).await.unwrap();
                }
            });
        })
    });
}

fn bench_coalesce_1000_changes(c: &mut Criterion) {
    let ids: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();

    c.bench_function("coalesce_1000_changes", |b| {
        b.iter(|| {
            let mut changes = ModelChanges::default();
            for i in 0..1000usize {
                let id = ids[i % ids.len()];
                let kind = match i % 3 {
                    0 => ChangeKind::Created,
                    1 => ChangeKind::Updated,
                    _ => ChangeKind::Deleted,
                };
                changes.record(black_box(id), black_box(kind));
            }
            black_box(changes.len());
        })
    });
}

fn bench_client_apply_1000_deltas(c: &mut Criterion) {
    let space = Uuid::new_v4();
    let frames: Vec<Frame> = (1..=1000u64).map(|v| sample_delta(space, v, 1)).collect();

    c.bench_function("client_apply_1000_deltas", |b| {
        b.iter(|| {
            let mut view = SpaceView::new(space);
            for frame in &frames {
                assert_eq!(view.apply(black_box(frame)), ApplyResult::Applied);
            }
            black_box(view.version(Model::Intentions));
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_sse_rendering,
    bench_fan_out_100_connections,
    bench_fan_out_1000_frames,
    bench_coalesce_1000_changes,
    bench_client_apply_1000_deltas,
);
criterion_main!(benches);
