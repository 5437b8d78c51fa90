use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use floorsync_link::{dispatch_frame, PushFanout, PushMessage, WireMessage};
use floorsync_store::{Fields, ServerVersion, StoreConfig, StoreHandle};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

fn telemetry(i: u64) -> PushMessage {
    PushMessage {
        entity_id: format!("line-{}", i % 32),
        payload: json!({
            "speed": i,
            "mode": "auto",
            "temp": 40.5,
            "alarms": [],
            "operator": "shift-a",
        })
        .as_object()
        .cloned()
        .unwrap_or_else(Fields::new),
        server_version: ServerVersion(i),
        sent_at: 1_700_000_000_000 + i,
    }
}

fn bench_push_encode(c: &mut Criterion) {
    let push = telemetry(7);
    c.bench_function("push_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::push(black_box(&push)).unwrap();
            black_box(msg.encode().unwrap())
        })
    });
}

fn bench_push_decode(c: &mut Criterion) {
    let bytes = WireMessage::push(&telemetry(7)).unwrap().encode().unwrap();
    c.bench_function("push_decode", |b| {
        b.iter(|| {
            let msg = WireMessage::decode(black_box(&bytes)).unwrap();
            black_box(msg.into_inbound().unwrap())
        })
    });
}

fn bench_dispatch_into_store(c: &mut Criterion) {
    let store = StoreHandle::new(StoreConfig::default());
    let frames: Vec<Vec<u8>> = (1..=1000)
        .map(|i| WireMessage::push(&telemetry(i)).unwrap().encode().unwrap())
        .collect();

    c.bench_function("dispatch_1000_pushes", |b| {
        b.iter(|| {
            for frame in &frames {
                black_box(dispatch_frame(&store, frame));
            }
        })
    });
}

fn bench_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_1000_frames");

    for clients in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            let fanout = PushFanout::new(2048);
            let receivers: Vec<_> = rt.block_on(async {
                let mut rxs = Vec::with_capacity(clients);
                for _ in 0..clients {
                    rxs.push(
                        fanout
                            .add_client(floorsync_link::ClientInfo {
                                client_id: uuid::Uuid::new_v4(),
                                remote_addr: "bench".into(),
                                connected_at: 0,
                            })
                            .await,
                    );
                }
                rxs
            });
            let frame = Arc::new(WireMessage::push(&telemetry(1)).unwrap().encode().unwrap());

            b.iter(|| {
                for _ in 0..1000 {
                    black_box(fanout.broadcast_raw(frame.clone()));
                }
            });
            drop(receivers);
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_push_encode,
    bench_push_decode,
    bench_dispatch_into_store,
    bench_fanout,
);
criterion_main!(benches);
