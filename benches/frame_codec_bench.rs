// Frame codec benchmarks: encode and decode across the payload sizes a
// small-message workload actually sees.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use swiftsock::{Frame, FrameCodec};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let codec = FrameCodec::default();

    for size in [16usize, 125, 1024, 16 * 1024] {
        let frame = Frame::binary(vec![0xA5u8; size]);
        group.bench_with_input(BenchmarkId::new("unmasked", size), &frame, |b, frame| {
            let mut out = Vec::with_capacity(size + 16);
            b.iter(|| {
                out.clear();
                codec.encode_into(black_box(frame), false, &mut out).unwrap();
                black_box(out.len());
            });
        });
        group.bench_with_input(BenchmarkId::new("masked", size), &frame, |b, frame| {
            let mut out = Vec::with_capacity(size + 16);
            b.iter(|| {
                out.clear();
                codec.encode_into(black_box(frame), true, &mut out).unwrap();
                black_box(out.len());
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let codec = FrameCodec::default();

    for size in [16usize, 125, 1024, 16 * 1024] {
        let unmasked = codec.encode(&Frame::binary(vec![0xA5u8; size]), false).unwrap();
        group.bench_with_input(
            BenchmarkId::new("unmasked", size),
            &unmasked,
            |b, wire| {
                b.iter(|| {
                    let (frame, used) = codec.decode(black_box(wire)).unwrap();
                    black_box((frame.payload.len(), used));
                });
            },
        );

        let masked = codec.encode(&Frame::binary(vec![0xA5u8; size]), true).unwrap();
        group.bench_with_input(BenchmarkId::new("masked", size), &masked, |b, wire| {
            b.iter(|| {
                let (frame, used) = codec.decode(black_box(wire)).unwrap();
                black_box((frame.payload.len(), used));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
