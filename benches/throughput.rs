//! Throughput benchmarks for EmberKV.
//!
//! Covers the engine on its own, the RESP parser, and full dispatch with a
//! WAL attached, so the cost of logging can be compared against in-memory
//! operation.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::commands::CommandHandler;
use emberkv::persistence::record;
use emberkv::persistence::{recover, FsyncPolicy, Persistence, PersistenceConfig};
use emberkv::protocol::{Request, RespParser};
use emberkv::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;

fn bench_strings(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..100_000 {
        engine.set(
            Bytes::from(format!("key:{}", i)),
            Bytes::from(format!("value:{}", i)),
        );
    }

    let mut group = c.benchmark_group("strings");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let value = Bytes::from("x".repeat(64));
        let mut i = 0u64;
        b.iter(|| {
            engine.set(Bytes::from(format!("new:{}", i)), value.clone());
            i += 1;
        });
    });

    group.bench_function("get_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(engine.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("incr", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("counter:{}", i % 1000);
            black_box(engine.incr(key.as_bytes()).ok());
            i += 1;
        });
    });

    group.finish();
}

fn bench_hashes(c: &mut Criterion) {
    let engine = StorageEngine::new();

    let mut group = c.benchmark_group("hashes");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hset", |b| {
        let mut i = 0u64;
        b.iter(|| {
            engine.hset(
                Bytes::from(format!("user:{}", i % 1000)),
                Bytes::from(format!("field:{}", i % 16)),
                Bytes::from("v"),
            );
            i += 1;
        });
    });

    group.bench_function("hget", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("user:{}", i % 1000);
            let field = format!("field:{}", i % 16);
            black_box(engine.hget(key.as_bytes(), field.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

fn bench_expiry(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..10_000 {
        engine.set(Bytes::from(format!("expire:{}", i)), Bytes::from("value"));
    }

    let mut group = c.benchmark_group("expiry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("expire_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("expire:{}", i % 10_000);
            engine.expire(key.as_bytes(), Duration::from_secs(3600));
            i += 1;
        });
    });

    group.bench_function("sweep_sample_20", |b| {
        b.iter(|| black_box(engine.purge_expired(Some(20))));
    });

    group.finish();
}

fn bench_keys(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..1_000 {
        engine.set(Bytes::from(format!("user:{}", i)), Bytes::from("u"));
        engine.set(Bytes::from(format!("session:{}", i)), Bytes::from("s"));
    }

    let mut group = c.benchmark_group("keys");
    group.bench_function("prefix", |b| b.iter(|| black_box(engine.keys(b"user:*"))));
    group.bench_function("all", |b| b.iter(|| black_box(engine.keys(b"*"))));
    group.finish();
}

fn bench_protocol(c: &mut Criterion) {
    let frame = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:123\r\n$16\r\n{\"name\":\"Ariz\"}x\r\n";
    let wal_line = record::encode(
        42,
        1_767_225_600_000,
        &[
            Bytes::from("SET"),
            Bytes::from("user:123"),
            Bytes::from("line\nbreak \"quoted\""),
        ],
    );

    let mut group = c.benchmark_group("protocol");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("parse_request", |b| {
        let mut parser = RespParser::new();
        b.iter(|| black_box(parser.parse(frame).ok()));
    });

    group.bench_function("decode_wal_record", |b| {
        b.iter(|| black_box(record::decode(&wal_line[..wal_line.len() - 1]).ok()));
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let in_memory = CommandHandler::in_memory(Arc::new(StorageEngine::new()));
    let logged = CommandHandler::new(
        Arc::new(StorageEngine::new()),
        Arc::new(Persistence::new(PersistenceConfig {
            fsync: FsyncPolicy::No,
            snapshot_enabled: false,
            ..PersistenceConfig::in_dir(dir.path())
        })),
    );
    runtime.block_on(recover(&logged)).unwrap();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    for (name, handler) in [("set_in_memory", &in_memory), ("set_with_wal", &logged)] {
        group.bench_function(name, |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = format!("key:{}", i % 10_000);
                let request = Request::from(&["SET", key.as_str(), "value"][..]);
                black_box(runtime.block_on(handler.execute(request)));
                i += 1;
            });
        });
    }

    group.bench_function("get_with_wal", |b| {
        b.iter(|| {
            let request = Request::from(&["GET", "key:1"][..]);
            black_box(runtime.block_on(logged.execute(request)));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_strings,
    bench_hashes,
    bench_expiry,
    bench_keys,
    bench_protocol,
    bench_dispatch,
);

criterion_main!(benches);
