//! Frame codec benchmarks.
//!
//! The codec sits on every RPC byte path, so encode/decode cost is worth
//! watching across payload sizes that bracket the common cases: a small
//! control message, a mid-size batch, and a near-cap transfer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;

use arclight_net::config::MAX_FRAME_SIZE;
use arclight_net::wire::{read_frame, write_frame, FrameType};

fn codec_roundtrip(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("bench runtime");

    let mut group = c.benchmark_group("frame_codec");
    for size in [256usize, 64 * 1024, 4 * 1024 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("roundtrip", size), &payload, |b, payload| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut writer = Cursor::new(Vec::with_capacity(payload.len() + 8));
                    write_frame(&mut writer, FrameType::Request, payload, MAX_FRAME_SIZE)
                        .await
                        .unwrap();
                    let mut cursor = Cursor::new(writer.into_inner());
                    read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap()
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, codec_roundtrip);
criterion_main!(benches);
