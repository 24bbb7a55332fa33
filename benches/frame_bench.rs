use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use netframe::{Frame, FrameCodec, MessageKind};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [0usize, 64, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Frame::new(MessageKind::Stream, vec![0u8; size]),
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 8);
                    FrameCodec::default().encode(frame, &mut buf).unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });

        let mut wire = BytesMut::new();
        FrameCodec::default()
            .encode(Frame::new(MessageKind::Stream, vec![0u8; size]), &mut wire)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || wire.clone(),
                |mut buf| FrameCodec::default().decode(&mut buf).unwrap().unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

/// Reassembly cost when the stream arrives in small TCP-sized pieces.
#[allow(clippy::unwrap_used)]
fn bench_segmented_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segmented_decode");
    let mut wire = BytesMut::new();
    let mut codec = FrameCodec::default();
    for i in 0..256usize {
        let payload = vec![(i & 0xFF) as u8; 64 + (i % 7) * 100];
        codec
            .encode(Frame::new(MessageKind::Message, payload), &mut wire)
            .unwrap();
    }
    let wire = wire.freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for &chunk in &[1usize, 7, 536, 1460] {
        group.bench_function(format!("chunk_{chunk}b"), |b| {
            b.iter(|| {
                let mut codec = FrameCodec::default();
                let mut buf = BytesMut::new();
                let mut frames = 0usize;
                for piece in wire.chunks(chunk) {
                    buf.extend_from_slice(piece);
                    while codec.decode(&mut buf).unwrap().is_some() {
                        frames += 1;
                    }
                }
                assert_eq!(frames, 256);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_segmented_decode);
criterion_main!(benches);
