//! Protocol encoding/decoding benchmarks.

use cqlmock_protocol::params::decode_query_params;
use cqlmock_protocol::{
    Buffer, Frame, FrameDecoder, Opcode, QueryFlags, QueryParameters, RequestMessage, Value,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn query_frame(version: u8, body_size: usize) -> Buffer {
    let message = RequestMessage::Query {
        query: "x".repeat(body_size),
        params: QueryParameters {
            consistency: 1,
            ..Default::default()
        },
    };
    Frame::request(version, 1, Opcode::Query, message.encode(version).unwrap())
        .encode()
        .unwrap()
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [16, 1000, 10000] {
        let frame = Frame::request(4, 1, Opcode::Query, Buffer::from_slice(&vec![b'x'; size]));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_chunked");

    // Ten pipelined frames fed in chunks of the given size.
    let data: Vec<u8> = (0..10).flat_map(|_| query_frame(4, 1000).as_slice().to_vec()).collect();
    for chunk in [1, 64, 4096] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &data, |b, data| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut frames = 0;
                for piece in data.chunks(chunk) {
                    decoder.decode(piece, |_| frames += 1);
                }
                black_box(frames)
            });
        });
    }

    group.finish();
}

fn bench_query_params_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_params_decode");

    for version in 1u8..=5 {
        let mut params = QueryParameters {
            consistency: 1,
            ..Default::default()
        };
        if version >= 2 {
            params.flags = QueryFlags::new()
                .with(QueryFlags::VALUES)
                .with(QueryFlags::PAGE_SIZE);
            params.values = (0..8).map(|i| Value::bytes(format!("value-{}", i).into_bytes())).collect();
            params.result_page_size = 5000;
        }
        let message = RequestMessage::Query {
            query: String::new(),
            params,
        };
        let body = message.encode(version).unwrap();
        // Skip the empty long string.
        let encoded = body.as_slice()[4..].to_vec();

        group.bench_with_input(BenchmarkId::from_parameter(version), &encoded, |b, encoded| {
            b.iter(|| black_box(decode_query_params(version, encoded, false).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode_chunked,
    bench_query_params_decode,
);
criterion_main!(benches);
