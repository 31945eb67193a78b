//! Throughput benchmarks

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use modsbus_core::core::message::{decode_frame, encode_frame, Envelope, Message};
use modsbus_core::core::transport::{SendHandle, Transport, TransportError};
use modsbus_core::RoutingFabric;
use std::hint::black_box;
use std::sync::Arc;

/// Transport that accepts and discards every frame
struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _envelope: &Envelope, _message: &[u8]) -> Result<SendHandle, TransportError> {
        Ok(SendHandle(0))
    }

    fn cancel(&self, _handle: SendHandle) {}
}

fn codec_benchmark(c: &mut Criterion) {
    let payload: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
    let message = Message::request(0x42, Bytes::from(payload.clone())).unwrap();
    let body = message.encode();
    let envelope = Envelope { size: body.len() as u16, dest_cport: 2, src_cport: 5 };
    let frame = encode_frame(&envelope, &body);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("message_encode", |b| {
        b.iter(|| black_box(&message).encode())
    });

    group.bench_function("frame_decode", |b| {
        b.iter(|| {
            let (_, body) = decode_frame(black_box(&frame)).unwrap();
            black_box(Message::decode(&body).unwrap())
        })
    });

    group.finish();
}

fn fabric_benchmark(c: &mut Criterion) {
    let fabric = RoutingFabric::new();
    fabric.add_device(1, Arc::new(NullTransport), 32).unwrap();
    fabric.add_device(3, Arc::new(NullTransport), 32).unwrap();
    for cport in 0..16 {
        fabric.add_route(1, cport, 3, cport).unwrap();
        fabric.add_route(3, cport, 1, cport).unwrap();
    }
    let body = Message::request(0x10, Bytes::from_static(&[0u8; 64])).unwrap().encode();

    let mut group = c.benchmark_group("fabric");
    group.throughput(Throughput::Elements(1));

    group.bench_function("forward", |b| {
        b.iter(|| black_box(fabric.forward(3, black_box(7), &body).unwrap()))
    });

    group.bench_function("resolve_miss", |b| {
        b.iter(|| black_box(fabric.resolve(3, black_box(30))))
    });

    group.finish();
}

criterion_group!(benches, codec_benchmark, fabric_benchmark);
criterion_main!(benches);
