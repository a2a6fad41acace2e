//! Performance benchmarks for endec-relay
//!
//! Run with: cargo bench

use endec_relay::broker::{Broker, PublishOptions, Route};
use endec_relay::frame::FrameExtractor;
use endec_relay::message::{normalize, NormalizeOptions};
use endec_relay::MemoryBroker;
use criterion::{criterion_group, criterion_main, Criterion};

const ALERT: &str = "ZCZC-EAS-RWT-031195+0030-2451620-KABC/FM-";

fn stream(frames: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    for i in 0..frames {
        bytes.extend_from_slice(format!("line noise {}\r\n", i).as_bytes());
        bytes.extend_from_slice(
            format!(
                "<ENDECSTART>\r\nTHE CIVIL AUTHORITIES HAVE ISSUED\r\nA REQUIRED WEEKLY TEST\r\n{}\r\n<ENDECEND>\r\n",
                ALERT
            )
            .as_bytes(),
        );
    }
    bytes
}

fn bench_extract(c: &mut Criterion) {
    let input = stream(100);

    let mut group = c.benchmark_group("extract_100_frames");
    for chunk in [1, 64, 4096] {
        group.bench_function(format!("{} byte reads", chunk), |b| {
            b.iter(|| {
                let mut extractor = FrameExtractor::new();
                let mut frames = 0;
                for part in input.chunks(chunk) {
                    frames += extractor.feed(part).len();
                }
                assert_eq!(frames, 100);
            });
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let frame = FrameExtractor::new().feed(&stream(1)).remove(0);

    c.bench_function("normalize default", |b| {
        b.iter(|| normalize(&frame, NormalizeOptions::default(), "/dev/ttyUSB0"));
    });

    let quiet = NormalizeOptions {
        quiet: true,
        ..Default::default()
    };
    c.bench_function("normalize quiet", |b| {
        b.iter(|| normalize(&frame, quiet, "/dev/ttyUSB0"));
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::default();
    let route = Route::healthcheck("bench");
    let payload = bytes::Bytes::from_static(b"{\"status\":\"alive\"}");

    c.bench_function("MemoryBroker publish", |b| {
        b.to_async(&rt).iter(|| async {
            broker
                .publish(&route, payload.clone(), &PublishOptions::default())
                .await
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_extract, bench_normalize, bench_memory_publish);
criterion_main!(benches);
