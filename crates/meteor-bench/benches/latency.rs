//! Latency benchmarks for Meteor.
//!
//! Per-message costs on the inbound path: channel parsing, wildcard
//! matching, classification and error replies.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meteor_core::{as_text, classify, error_packet, FrameScope};
use meteor_protocol::{ChannelId, JsonCodec, Message};

/// Benchmark channel parsing and subscription matching.
fn bench_channels(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel");

    group.bench_function("parse", |b| {
        b.iter(|| ChannelId::parse(black_box("/chat/rooms/lobby")).unwrap())
    });

    let wild = ChannelId::parse("/chat/**").unwrap();
    let channel = ChannelId::parse("/chat/rooms/lobby").unwrap();
    group.bench_function("match_deep_wild", |b| {
        b.iter(|| black_box(&wild).matches(black_box(&channel)))
    });

    group.bench_function("frame_scope_16", |b| {
        b.iter(|| {
            let mut scope = FrameScope::new();
            for _ in 0..16 {
                black_box(scope.resolve("/chat/rooms/lobby").unwrap());
            }
        })
    });

    group.finish();
}

/// Benchmark router classification and error replies.
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for path in ["/meta/connect", "/meta/bogus", "/chat/*", "/service/echo", "/chat/lobby"] {
        group.bench_function(format!("classify {path}"), |b| {
            b.iter(|| classify(black_box(path)))
        });
    }

    let mut request = Message::for_channel("/meta/bogus");
    request.put("id", "7");
    group.bench_function("error_reply", |b| {
        b.iter(|| {
            let packet = error_packet("/meta/bogus", "Unknown meta channel", &request, None);
            as_text(&[packet], &JsonCodec).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_channels, bench_routing);
criterion_main!(benches);
