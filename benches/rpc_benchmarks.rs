// ABOUTME: Benchmark suite for request/response encoding and streaming decode throughput
// ABOUTME: Measures the codec in isolation, independent of any socket I/O

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use msgpack_rpc::codec::{decode_request, pack_request, pack_response, CodecOptions, Decoder, ResponseFrame};
use rmpv::Value;

fn sample_params(count: usize) -> Vec<Value> {
    (0..count).map(|i| Value::from(i as i64)).collect()
}

fn bench_pack_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_request");
    for size in [0usize, 4, 32] {
        let params = sample_params(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &params, |b, params| {
            b.iter(|| black_box(pack_request(1, "benchmark_method", params)));
        });
    }
    group.finish();
}

fn bench_decode_request(c: &mut Criterion) {
    let params = sample_params(8);
    let bytes = pack_request(1, "benchmark_method", &params);

    c.bench_function("decode_request", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.feed(&bytes);
            let value = decoder.next().unwrap().unwrap();
            black_box(decode_request(&value, &CodecOptions::default()).unwrap());
        });
    });
}

fn bench_pack_response(c: &mut Criterion) {
    let frame = ResponseFrame::ok(1, Value::String("a reasonably sized result string".into()));
    c.bench_function("pack_response", |b| {
        b.iter(|| black_box(pack_response(&frame)));
    });
}

fn bench_streaming_decode_many_frames(c: &mut Criterion) {
    let mut combined = Vec::new();
    for i in 0..64u64 {
        combined.extend_from_slice(&pack_request(i, "benchmark_method", &sample_params(4)));
    }

    c.bench_function("decode_64_pipelined_frames", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.feed(&combined);
            let mut count = 0;
            while let Some(value) = decoder.next().unwrap() {
                black_box(decode_request(&value, &CodecOptions::default()).unwrap());
                count += 1;
            }
            assert_eq!(count, 64);
        });
    });
}

criterion_group!(
    benches,
    bench_pack_request,
    bench_decode_request,
    bench_pack_response,
    bench_streaming_decode_many_frames
);
criterion_main!(benches);
