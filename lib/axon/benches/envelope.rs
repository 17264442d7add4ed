use axon::envelope::{Envelope, Part};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let plain = Envelope::single(Part::new(payload(16 * 1024), "bench.Payload"));
    let packed = Envelope::single(
        Part::new(payload(16 * 1024), "bench.Payload").compressed("zlib", -1),
    );

    c.bench_function("encode_16k_plain", |b| {
        b.iter(|| black_box(&plain).encode().unwrap())
    });
    c.bench_function("encode_16k_zlib", |b| {
        b.iter(|| black_box(&packed).encode().unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let plain = Envelope::single(Part::new(payload(16 * 1024), "bench.Payload"))
        .encode()
        .unwrap();
    let packed = Envelope::single(
        Part::new(payload(16 * 1024), "bench.Payload").compressed("lz4", -1),
    )
    .encode()
    .unwrap();

    c.bench_function("decode_16k_plain", |b| {
        b.iter(|| Envelope::decode(black_box(&plain)).unwrap())
    });
    c.bench_function("decode_16k_lz4", |b| {
        b.iter(|| Envelope::decode(black_box(&packed)).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
