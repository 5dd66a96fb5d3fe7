// packages/engine/benches/frame_bench.rs
//! Benchmarks for frame encoding and decoding.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relaypool_engine::protocol::{Frame, FrameCodec, Payload};
use tokio_util::codec::{Decoder, Encoder};

fn payload(size: usize) -> Payload {
    Payload::new(&br#"{"headers":{"host":"localhost"}}"#[..], vec![b'x'; size])
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [64usize, 4096, 1 << 20].iter() {
        let payload = payload(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            b.iter(|| {
                buf.clear();
                let frame = Frame::data(black_box(&payload)).unwrap();
                codec.encode(frame, &mut buf).unwrap();
                black_box(buf.len())
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [64usize, 4096, 1 << 20].iter() {
        let mut encoded = BytesMut::new();
        FrameCodec::new()
            .encode(Frame::data(&payload(*size)).unwrap(), &mut encoded)
            .unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut codec = FrameCodec::new();
            b.iter(|| {
                let mut src = encoded.clone();
                let frame = codec.decode(&mut src).unwrap().unwrap();
                black_box(frame.into_payload().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
