//! Fan-out benchmarks for Relay.
//!
//! These benchmarks measure broadcast cost against connections that discard
//! everything written to them, so only the engine itself is timed.

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tenvis_relay_core::{Broadcaster, CancellationToken, Connection, ConnectionId, MessageKind};
use tenvis_relay_transport::{MessageWriter, TransportError};
use tokio::runtime::Runtime;

/// Connection that counts bytes and drops them.
struct NullConnection {
    id: ConnectionId,
    bytes: Arc<AtomicU64>,
}

struct NullWriter {
    bytes: Arc<AtomicU64>,
}

#[async_trait]
impl MessageWriter for NullWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    async fn finish(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl Connection for NullConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn next_writer(&self, _kind: MessageKind) -> Result<Box<dyn MessageWriter>, TransportError> {
        Ok(Box::new(NullWriter {
            bytes: Arc::clone(&self.bytes),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn broadcaster_with(rt: &Runtime, concurrency: usize, subscribers: usize) -> Broadcaster {
    let broadcaster = Broadcaster::new(concurrency).unwrap();
    let bytes = Arc::new(AtomicU64::new(0));
    rt.block_on(async {
        for i in 0..subscribers {
            let conn = NullConnection {
                id: ConnectionId::new(format!("conn-{}", i)),
                bytes: Arc::clone(&bytes),
            };
            broadcaster.register(Arc::new(conn)).await.unwrap();
        }
    });
    broadcaster
}

/// Benchmark broadcast across subscriber counts.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let ctx = CancellationToken::new();
    let payload = Bytes::from(vec![b'x'; 64]);
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000].iter() {
        let broadcaster = broadcaster_with(&rt, 10, *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(broadcaster.broadcast(
                    &ctx,
                    MessageKind::Text,
                    black_box(payload.clone()),
                ))
                .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark pool width against a fixed audience.
fn bench_concurrency(c: &mut Criterion) {
    let rt = runtime();
    let ctx = CancellationToken::new();
    let payload = Bytes::from(vec![0u8; 1024]);
    let mut group = c.benchmark_group("concurrency");
    group.throughput(Throughput::Elements(1000));

    for width in [1, 4, 16, 64].iter() {
        let broadcaster = broadcaster_with(&rt, *width, 1000);
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| {
                rt.block_on(broadcaster.broadcast(
                    &ctx,
                    MessageKind::Binary,
                    black_box(payload.clone()),
                ))
                .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark payload size with one subscriber.
fn bench_payload(c: &mut Criterion) {
    let rt = runtime();
    let ctx = CancellationToken::new();
    let broadcaster = broadcaster_with(&rt, 1, 1);
    let mut group = c.benchmark_group("payload");

    for size in [64usize, 1024, 65536].iter() {
        let payload = Bytes::from(vec![0u8; *size]);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(broadcaster.broadcast(
                    &ctx,
                    MessageKind::Binary,
                    black_box(payload.clone()),
                ))
                .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_concurrency, bench_payload);
criterion_main!(benches);
