use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use shoal_core::protocol::{CommandChunkJoiner, PeerCommand, frame_command};

fn live_announcement() -> PeerCommand {
    PeerCommand::SegmentsAnnouncement {
        loaded: (1_000_000..1_000_400).collect(),
        http_loading: vec![1_000_400, 1_000_401],
    }
}

fn bench_command_encoding(c: &mut Criterion) {
    let announcement = live_announcement();
    let request = PeerCommand::SegmentRequest {
        segment_id: 1_000_123,
        request_id: 77_777,
        byte_from: Some(65_536),
    };

    c.bench_function("encode_announcement_400_ids", |b| {
        b.iter(|| black_box(&announcement).encode())
    });
    c.bench_function("encode_segment_request", |b| {
        b.iter(|| black_box(&request).encode())
    });
}

fn bench_command_decoding(c: &mut Criterion) {
    let encoded = live_announcement().encode().unwrap();

    c.bench_function("decode_announcement_400_ids", |b| {
        b.iter(|| PeerCommand::decode(&mut black_box(encoded.clone())))
    });
}

fn bench_framing(c: &mut Criterion) {
    let encoded = live_announcement().encode().unwrap();

    c.bench_function("frame_and_join_small_messages", |b| {
        b.iter(|| {
            let mut joiner = CommandChunkJoiner::new();
            let mut joined = None;
            for chunk in frame_command(black_box(&encoded), 64).unwrap() {
                joined = joiner.add_chunk(&chunk).unwrap();
            }
            joined
        })
    });
}

criterion_group!(benches, bench_command_encoding, bench_command_decoding, bench_framing);
criterion_main!(benches);
