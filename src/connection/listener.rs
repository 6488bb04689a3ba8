//! Accept loop with graceful shutdown.
//!
//! Every accepted client runs in a task owned by a `JoinSet`. When the
//! shutdown signal fires the listener is dropped, each connection closes once
//! it has answered the requests it already read, and [`serve`] returns only
//! after every connection task has finished. Nothing can mutate the engine
//! after that, so the caller may flush and close persistence safely.

use crate::commands::CommandHandler;
use crate::connection::handler::{handle_connection, ConnectionStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Serves clients from `listener` until `shutdown` reads `true` or its
/// sender is dropped.
pub async fn serve(
    listener: TcpListener,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let connection_shutdown = shutdown.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    connections.spawn(handle_connection(
                        stream,
                        addr,
                        command_handler.clone(),
                        Arc::clone(&stats),
                        idle_timeout,
                        connection_shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "Connection task failed");
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    drop(listener);
    info!(
        open = connections.len(),
        "Stopped accepting connections, waiting for clients to close"
    );
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Connection task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(serve(
            listener,
            CommandHandler::in_memory(Arc::clone(&storage)),
            Arc::clone(&stats),
            None,
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        shutdown_tx.send(true).unwrap();

        // The server hangs up on the idle client.
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        // Nothing is applied once the server has returned.
        let _ = client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nlate\r\n$1\r\n1\r\n")
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.get(b"a"), Some(Bytes::from("1")));
        assert!(!storage.exists(b"late"));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_the_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(
            listener,
            CommandHandler::in_memory(Arc::new(StorageEngine::new())),
            Arc::new(ConnectionStats::new()),
            None,
            shutdown_rx,
        ));

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }
}
