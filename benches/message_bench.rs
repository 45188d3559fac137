use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use peerlink::core::codec::{Frame, FrameCodec};
use peerlink::core::message::{Message, Value};
use peerlink::utils::crypto::{ChaChaCipher, FrameCipher};
use tokio_util::codec::{Decoder, Encoder};

fn sample_messages() -> Vec<Message> {
    let location = Message::new()
        .with("world", "survival")
        .with("x", 128.5f64)
        .with("y", 64i64)
        .with("z", -3021.25f64);
    vec![
        Message::new().with("type", "keepAlive"),
        Message::new()
            .with("type", "teleport")
            .with("player", "Notch")
            .with("target", location.clone())
            .with("requestId", 42i64),
        Message::new().with("type", "chat").with("text", "héllo: 100% ".repeat(64)),
        Message::new().with(
            "batch",
            (0..256i64)
                .map(|i| Value::from(location.clone().with("i", i)))
                .collect::<Vec<_>>(),
        ),
    ]
}

fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");
    let messages = sample_messages();

    group.bench_function("encode", |b| {
        b.iter_batched(
            || messages.clone(),
            |msgs| {
                for m in msgs {
                    let _ = m.encode();
                }
            },
            BatchSize::SmallInput,
        )
    });

    let blobs: Vec<Vec<u8>> = messages.iter().map(Message::encode).collect();
    group.bench_function("decode", |b| {
        b.iter(|| {
            for blob in &blobs {
                let _ = Message::decode(blob).unwrap();
            }
        })
    });

    group.finish();
}

fn bench_frame_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_path");
    let body = sample_messages()[1].encode();

    group.bench_function("frame_plain", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            codec.encode(Frame::new(body.clone(), false), &mut buf).unwrap();
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            let _ = Message::decode(&frame.payload).unwrap();
        })
    });

    let cipher = ChaChaCipher;
    group.bench_function("frame_encrypted", |b| {
        b.iter(|| {
            let sealed = cipher.encrypt(b"link-secret", &body).unwrap();
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            codec.encode(Frame::new(sealed, true), &mut buf).unwrap();
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            let plain = cipher.decrypt(b"link-secret", &frame.payload).unwrap();
            let _ = Message::decode(&plain).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_message_codec, bench_frame_path);
criterion_main!(benches);
