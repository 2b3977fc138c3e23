use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use umbra_wire::{ByteBuffer, FrameCodec};

fn bench_codec_push(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..64 {
        wire.extend(FrameCodec::encode(&format!("TO peer-{i} payload {i}")));
    }

    let mut group = c.benchmark_group("codec_push");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("push_64_frames", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::new(64 * 1024);
            codec.push(black_box(&wire)).unwrap()
        })
    });

    group.finish();
}

fn bench_codec_push_by_chunk(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..64 {
        wire.extend(FrameCodec::encode(&format!("TO peer-{i} payload {i}")));
    }
    let chunk_sizes: Vec<(usize, &str)> = vec![
        (16, "16_byte_chunks"),
        (128, "128_byte_chunks"),
        (1024, "1024_byte_chunks"),
    ];

    let mut group = c.benchmark_group("codec_push_by_chunk");

    for (size, name) in chunk_sizes {
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut codec = FrameCodec::new(64 * 1024);
                let mut frames = 0;
                for chunk in wire.chunks(size) {
                    frames += codec.push(black_box(chunk)).unwrap().len();
                }
                frames
            })
        });
    }

    group.finish();
}

fn bench_buffer_cycle(c: &mut Criterion) {
    let payload = vec![0xAB; 4096];

    let mut group = c.benchmark_group("buffer_cycle");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("put_flip_drain_compact", |b| {
        let mut buf = ByteBuffer::new(8192, 1024 * 1024);
        b.iter(|| {
            buf.put(black_box(&payload)).unwrap();
            buf.flip();
            buf.advance(payload.len()).unwrap();
            buf.compact();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_push,
    bench_codec_push_by_chunk,
    bench_buffer_cycle
);
criterion_main!(benches);
