use std::hint::black_box;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion};
use ot_presence::{
    CachedOp, MemoryConnection, OpCache, PresenceMessage, PresenceType, SendOptions, TextType,
};
use serde_json::json;
use uuid::Uuid;

fn sample_message() -> PresenceMessage {
    let mut message = PresenceMessage::new(
        "presence-1",
        "books",
        "northern-lights",
        Some(json!({"index": 42, "length": 3})),
        7,
        SendOptions::default(),
    );
    message.version = Some(128);
    message.type_uri = Some(TextType::URI.to_owned());
    message.src = Some(Uuid::new_v4());
    message
}

fn bench_message_encode(c: &mut Criterion) {
    let message = sample_message();

    c.bench_function("presence_message_encode", |b| {
        b.iter(|| black_box(black_box(&message).encode().unwrap()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let encoded = sample_message().encode().unwrap();

    c.bench_function("presence_message_decode", |b| {
        b.iter(|| black_box(PresenceMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_text_transform(c: &mut Criterion) {
    let presence = json!({"index": 42});
    let op = json!({"index": 5, "value": "ern"});

    c.bench_function("text_transform_presence", |b| {
        b.iter(|| {
            black_box(
                TextType
                    .transform_presence(black_box(&presence), black_box(&op), false)
                    .unwrap(),
            )
        })
    });
}

fn bench_op_cache_replay_100(c: &mut Criterion) {
    let mut cache = OpCache::new();
    for version in 1..=100 {
        cache.insert(
            version,
            CachedOp::Operation {
                op: json!({"index": 0, "value": "a"}),
                is_own_op: false,
            },
        );
    }
    let value = json!({"index": 10});

    c.bench_function("op_cache_replay_100", |b| {
        b.iter(|| {
            black_box(
                cache
                    .replay(1, Some(black_box(value.clone())), Some(&TextType))
                    .unwrap(),
            )
        })
    });
}

fn bench_remote_update_commit(c: &mut Criterion) {
    let connection = MemoryConnection::new();
    let doc = connection.document("books", "northern-lights");
    doc.create(Rc::new(TextType));
    let mut seq = 0;

    c.bench_function("remote_update_commit", |b| {
        b.iter(|| {
            seq += 1;
            let mut message = sample_message();
            message.version = Some(1);
            message.seq = seq;
            connection.receive(black_box(message));
        })
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_text_transform,
    bench_op_cache_replay_100,
    bench_remote_update_commit,
);
criterion_main!(benches);
