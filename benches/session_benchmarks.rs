//! Session-layer benchmarks: handshake cost and the established record path.
//!
//! Run with: `cargo bench --bench session_benchmarks`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use umbra_crypto::{HandshakeStatus, Identity, NoiseEngine, Role, SessionEngine, TrustAnyVerified};
use umbra_wire::ByteBuffer;

/// Drive the full handshake between two engines in memory; verification
/// tasks run inline.
fn handshake_pair() -> (NoiseEngine, NoiseEngine) {
    let client_id = Identity::generate().unwrap();
    let server_id = Identity::generate().unwrap();
    let mut client =
        NoiseEngine::new(Role::Initiator, &client_id, Arc::new(TrustAnyVerified)).unwrap();
    let mut server =
        NoiseEngine::new(Role::Responder, &server_id, Arc::new(TrustAnyVerified)).unwrap();

    let mut to_server: Vec<u8> = Vec::new();
    let mut to_client: Vec<u8> = Vec::new();
    for _ in 0..64 {
        if client.handshake_status() == HandshakeStatus::Complete
            && server.handshake_status() == HandshakeStatus::Complete
        {
            return (client, server);
        }
        step(&mut client, &mut to_client, &mut to_server);
        step(&mut server, &mut to_server, &mut to_client);
    }
    panic!("handshake did not converge");
}

fn step(engine: &mut NoiseEngine, inbox: &mut Vec<u8>, outbox: &mut Vec<u8>) {
    match engine.handshake_status() {
        HandshakeStatus::AwaitingEncrypt => {
            let mut src = ByteBuffer::with_capacity(16);
            src.flip();
            let mut dst = ByteBuffer::with_capacity(4096);
            engine.encrypt(&mut src, &mut dst).unwrap();
            dst.flip();
            outbox.extend_from_slice(dst.unread());
        }
        HandshakeStatus::AwaitingDecrypt => {
            if inbox.is_empty() {
                return;
            }
            let mut src = ByteBuffer::with_capacity(inbox.len().max(64));
            src.put(inbox).unwrap();
            src.flip();
            let mut dst = ByteBuffer::with_capacity(4096);
            let result = engine.decrypt(&mut src, &mut dst).unwrap();
            inbox.drain(..result.consumed);
        }
        HandshakeStatus::AwaitingTask => {
            if let Some(task) = engine.take_task() {
                task.run();
            }
        }
        _ => {}
    }
}

/// Full XX handshake with claim verification, both sides in one thread.
fn bench_handshake(c: &mut Criterion) {
    c.bench_function("handshake_full", |b| {
        b.iter(|| {
            let (client, server) = handshake_pair();
            black_box((client, server));
        });
    });
}

/// Established record path: encrypt then decrypt one payload.
fn bench_record_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_roundtrip");

    for size in [256usize, 4096, 32 * 1024] {
        let (mut client, mut server) = handshake_pair();
        let payload = vec![0x42_u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let mut plain = ByteBuffer::new(size.max(4096), 1024 * 1024);
            let mut wire = ByteBuffer::new(size + 4096, 1024 * 1024);
            let mut out = ByteBuffer::new(size.max(4096), 1024 * 1024);
            b.iter(|| {
                plain.clear();
                wire.clear();
                out.clear();
                plain.put(payload).unwrap();
                plain.flip();
                while plain.has_remaining() {
                    client.encrypt(&mut plain, &mut wire).unwrap();
                }
                wire.flip();
                while wire.has_remaining() {
                    server.decrypt(&mut wire, &mut out).unwrap();
                }
                black_box(out.position());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_handshake, bench_record_roundtrip);
criterion_main!(benches);
