use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use treesync::protocol::{decode_frame, encode_frame, FileChunk, Message, NewVersion};

fn file_chunk(size: usize) -> Message {
    Message::FileChunk(FileChunk {
        path: "projects/notes/chapter-01.md".to_string(),
        client_version: 17,
        offset: 4 * 1024 * 1024,
        data: Bytes::from(vec![0xA5; size]),
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");

    for size in [0usize, 4 * 1024, 256 * 1024].iter() {
        let msg = file_chunk(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| encode_frame(black_box(msg)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");

    for size in [0usize, 4 * 1024, 256 * 1024].iter() {
        let frame = encode_frame(&file_chunk(*size));
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut buf = BytesMut::from(&frame[..]);
                decode_frame(black_box(&mut buf), u64::MAX)
            })
        });
    }

    group.finish();
}

fn bench_announcement_batch(c: &mut Criterion) {
    // A burst of small notices decoded from one receive buffer
    let mut wire = BytesMut::new();
    for i in 0..1000u64 {
        wire.extend_from_slice(&encode_frame(&Message::NewVersion(NewVersion {
            path: format!("dir{}/file{}.txt", i % 10, i),
            base_version: i,
            client_version: i % 5,
            size: i * 100,
        })));
    }
    let wire = wire.freeze();

    c.bench_function("decode_1000_notices", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            let mut n = 0;
            while let Ok(Some(msg)) = decode_frame(&mut buf, u64::MAX) {
                black_box(msg);
                n += 1;
            }
            n
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_announcement_batch);
criterion_main!(benches);
