//! Restart and replay behaviour across the whole stack.
//!
//! Each test runs a "server" against a temporary data directory, drops it
//! without ceremony (or shuts it down cleanly), then recovers a fresh one
//! from the same directory and compares what it sees.

use bytes::{Bytes, BytesMut};
use emberkv::commands::CommandHandler;
use emberkv::connection::{serve, ConnectionStats};
use emberkv::persistence::{recover, Persistence, PersistenceConfig};
use emberkv::protocol::{parse_message, Request, RespValue};
use emberkv::storage::{DumpEntry, KeyTtl, StorageEngine};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

async fn start(dir: &Path) -> CommandHandler {
    let handler = CommandHandler::new(
        Arc::new(StorageEngine::new()),
        Arc::new(Persistence::new(PersistenceConfig::in_dir(dir))),
    );
    recover(&handler).await.unwrap();
    handler
}

async fn run(handler: &CommandHandler, args: &[&str]) -> RespValue {
    let outcome = handler.dispatch(Request::from(args)).await;
    assert!(
        outcome.durability_warning.is_none(),
        "{:?} was not logged",
        args
    );
    outcome.response
}

#[tokio::test]
async fn test_restart_reproduces_keys_values_and_ttls() {
    let dir = tempdir().unwrap();

    {
        let live = start(dir.path()).await;
        run(&live, &["SET", "name", "Ariz"]).await;
        run(&live, &["SET", "counter", "41"]).await;
        run(&live, &["INCR", "counter"]).await;
        run(&live, &["HSET", "user:1", "email", "a@example.com"]).await;
        run(&live, &["HSET", "user:1", "plan", "free"]).await;
        run(&live, &["HDEL", "user:1", "plan"]).await;
        run(&live, &["SET", "session", "abc"]).await;
        run(&live, &["EXPIRE", "session", "100"]).await;
        run(&live, &["SET", "gone", "x"]).await;
        run(&live, &["DEL", "gone"]).await;
    }

    let restarted = start(dir.path()).await;
    let storage = restarted.storage();
    assert_eq!(storage.len(), 4);
    assert_eq!(storage.get(b"name"), Some(Bytes::from("Ariz")));
    assert_eq!(storage.get(b"counter"), Some(Bytes::from("42")));
    assert_eq!(
        storage.hget(b"user:1", b"email"),
        Some(Bytes::from("a@example.com"))
    );
    assert_eq!(storage.hget(b"user:1", b"plan"), None);
    assert!(!storage.exists(b"gone"));

    match storage.ttl(b"session") {
        KeyTtl::Expires(left) => {
            assert!(left <= Duration::from_secs(100));
            assert!(left > Duration::from_secs(95));
        }
        other => panic!("expected a TTL, got {:?}", other),
    }
    assert_eq!(storage.ttl(b"name"), KeyTtl::Persistent);
}

#[tokio::test]
async fn test_snapshot_restart_matches_wal_restart() {
    let dir = tempdir().unwrap();

    {
        let live = start(dir.path()).await;
        run(&live, &["SET", "a", "1"]).await;
        run(&live, &["HSET", "h", "f", "v"]).await;
        run(&live, &["SET", "t", "v"]).await;
        run(&live, &["EXPIRE", "t", "50"]).await;
        live.persistence().shutdown(live.storage()).await.unwrap();

        // The log is closed: later mutations still apply but are flagged.
        let outcome = live.dispatch(Request::from(&["SET", "late", "1"][..])).await;
        assert_eq!(outcome.response, RespValue::ok());
        assert!(outcome.durability_warning.is_some());
    }

    // Everything is in the snapshot; the compacted log holds nothing.
    let wal = PersistenceConfig::in_dir(dir.path()).wal_path();
    assert_eq!(std::fs::metadata(&wal).unwrap().len(), 0);

    let handler = CommandHandler::new(
        Arc::new(StorageEngine::new()),
        Arc::new(Persistence::new(PersistenceConfig::in_dir(dir.path()))),
    );
    let report = recover(&handler).await.unwrap();
    assert_eq!(report.snapshot_keys, 3);
    assert_eq!(report.replayed, 0);
    assert_eq!(report.last_seq, 4);

    let storage = handler.storage();
    assert_eq!(storage.get(b"a"), Some(Bytes::from("1")));
    assert_eq!(storage.hget(b"h", b"f"), Some(Bytes::from("v")));
    assert!(!storage.exists(b"late"));
    assert!(matches!(storage.ttl(b"t"), KeyTtl::Expires(left) if left <= Duration::from_secs(50)));
}

#[tokio::test]
async fn test_expire_replays_to_the_original_deadline() {
    let dir = tempdir().unwrap();

    {
        let live = start(dir.path()).await;
        run(&live, &["SET", "short", "v"]).await;
        run(&live, &["EXPIRE", "short", "1"]).await;
        run(&live, &["SET", "long", "v"]).await;
        run(&live, &["EXPIRE", "long", "3"]).await;
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // A relative replay would give both keys a fresh lease.
    let restarted = start(dir.path()).await;
    assert!(!restarted.storage().exists(b"short"));
    let ttl = run(&restarted, &["TTL", "long"]).await;
    let secs = ttl.as_integer().unwrap();
    assert!((1..=2).contains(&secs), "TTL was {}", secs);
}

fn sorted_dump(handler: &CommandHandler) -> Vec<DumpEntry> {
    let mut entries = handler.storage().dump();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

#[tokio::test]
async fn test_restart_matches_live_state_after_deadlines_pass() {
    let dir = tempdir().unwrap();
    let live = start(dir.path()).await;

    run(&live, &["SET", "c", "5"]).await;
    run(&live, &["EXPIRE", "c", "1"]).await;
    assert_eq!(run(&live, &["INCR", "c"]).await, RespValue::integer(6));
    run(&live, &["HSET", "h", "f", "v"]).await;
    run(&live, &["EXPIRE", "h", "1"]).await;
    run(&live, &["HSET", "h", "g", "w"]).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The hash is gone, so INCR starts a fresh counter without a TTL.
    assert_eq!(run(&live, &["INCR", "h"]).await, RespValue::integer(1));
    assert_eq!(run(&live, &["EXISTS", "c"]).await, RespValue::integer(0));

    let restarted = start(dir.path()).await;
    assert_eq!(sorted_dump(&restarted), sorted_dump(&live));
    assert_eq!(run(&restarted, &["EXISTS", "c"]).await, RespValue::integer(0));
    assert_eq!(
        run(&restarted, &["GET", "h"]).await,
        RespValue::bulk_string(Bytes::from("1"))
    );
    assert_eq!(run(&restarted, &["TTL", "h"]).await, RespValue::integer(-1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_replay_to_the_same_state() {
    let dir = tempdir().unwrap();
    let live = start(dir.path()).await;

    let tasks: Vec<_> = (0..8)
        .map(|task| {
            let handler = live.clone();
            tokio::spawn(async move {
                for i in 0..200usize {
                    let key = format!("k{}", (task + i) % 4);
                    let value = format!("{}-{}", task, i);
                    let args: Vec<&str> = match (task * 7 + i) % 5 {
                        0 => vec!["SET", key.as_str(), value.as_str()],
                        1 => vec!["DEL", key.as_str()],
                        2 => vec!["HSET", "shared", key.as_str(), value.as_str()],
                        3 => vec!["EXPIRE", key.as_str(), "3600"],
                        _ => vec!["INCR", "counter"],
                    };
                    let outcome = handler.dispatch(Request::from(&args[..])).await;
                    assert!(outcome.durability_warning.is_none());
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let restarted = start(dir.path()).await;
    assert_eq!(sorted_dump(&restarted), sorted_dump(&live));
    assert_eq!(
        restarted.storage().get(b"counter"),
        live.storage().get(b"counter")
    );
}

#[tokio::test]
async fn test_torn_tail_is_dropped_and_log_stays_usable() {
    let dir = tempdir().unwrap();
    let wal = PersistenceConfig::in_dir(dir.path()).wal_path();

    {
        let live = start(dir.path()).await;
        run(&live, &["SET", "a", "1"]).await;
        run(&live, &["SET", "b", "2"]).await;
    }

    // A crash in the middle of writing the third record.
    let mut file = OpenOptions::new().append(true).open(&wal).unwrap();
    file.write_all(b"3 SET \"c\" \"3").unwrap();
    drop(file);

    {
        let restarted = start(dir.path()).await;
        assert_eq!(restarted.storage().len(), 2);
        assert!(!restarted.storage().exists(b"c"));
        run(&restarted, &["SET", "c", "fresh"]).await;
    }

    let again = start(dir.path()).await;
    assert_eq!(again.storage().get(b"c"), Some(Bytes::from("fresh")));
    assert_eq!(again.storage().len(), 3);
}

#[tokio::test]
async fn test_binary_and_awkward_values_survive_replay() {
    let dir = tempdir().unwrap();
    let awkward = Bytes::from_static(b"line one\nline \"two\"\t\\ end\r\x00\xff");

    {
        let live = start(dir.path()).await;
        let outcome = live
            .dispatch(Request::new(vec![
                Bytes::from("SET"),
                Bytes::from("key with spaces"),
                awkward.clone(),
            ]))
            .await;
        assert_eq!(outcome.response, RespValue::ok());
    }

    let restarted = start(dir.path()).await;
    assert_eq!(restarted.storage().get(b"key with spaces"), Some(awkward));
}

async fn spawn_server(handler: CommandHandler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        // Held for the life of the server.
        let _shutdown_tx = shutdown_tx;
        serve(
            listener,
            handler,
            Arc::new(ConnectionStats::new()),
            None,
            shutdown_rx,
        )
        .await;
    });
    addr
}

struct Client {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffer: BytesMut::new(),
        }
    }

    async fn call(&mut self, args: &[&str]) -> RespValue {
        let frame = Request::from(args).to_frame().serialize();
        self.stream.write_all(&frame).await.unwrap();

        loop {
            if let Some((reply, consumed)) = parse_message(&self.buffer).unwrap() {
                let _ = self.buffer.split_to(consumed);
                return reply;
            }
            let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
            assert!(n > 0, "server closed the connection");
        }
    }
}

#[tokio::test]
async fn test_counter_expiry_scenario_over_tcp() {
    let dir = tempdir().unwrap();
    let addr = spawn_server(start(dir.path()).await).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.call(&["SET", "a", "1"]).await, RespValue::ok());
    assert_eq!(client.call(&["INCR", "a"]).await, RespValue::integer(2));
    assert_eq!(client.call(&["TTL", "a"]).await, RespValue::integer(-1));
    assert_eq!(client.call(&["EXPIRE", "a", "10"]).await, RespValue::integer(1));

    let ttl = client.call(&["TTL", "a"]).await.as_integer().unwrap();
    assert!((1..=10).contains(&ttl), "TTL was {}", ttl);

    // Shorten the lease rather than waiting out ten seconds.
    assert_eq!(client.call(&["EXPIRE", "a", "1"]).await, RespValue::integer(1));
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(client.call(&["GET", "a"]).await, RespValue::null());
    assert_eq!(client.call(&["EXISTS", "a"]).await, RespValue::integer(0));
    assert_eq!(client.call(&["TTL", "a"]).await, RespValue::integer(-2));

    let restarted = start(dir.path()).await;
    assert!(!restarted.storage().exists(b"a"));
}
