//! Unix-socket market data listener.
//!
//! Any number of writers may connect; each sends JSON lines. Lines from one
//! connection are forwarded in order.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::parse_line;
use crate::core::Result;
use crate::orderbook::MarketEvent;

/// Listen on a Unix socket and forward parsed events.
///
/// Returns only on an accept/bind error or once the engine side of the
/// channel is gone.
pub async fn listen(socket_path: PathBuf, tx: flume::Sender<MarketEvent>) -> Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path.display(), "IPC listener started");

    loop {
        let (stream, _) = listener.accept().await?;
        if tx.is_disconnected() {
            return Ok(());
        }
        let tx = tx.clone();
        let path = socket_path.clone();
        tokio::spawn(async move {
            let forwarded = forward(stream, &tx).await;
            tracing::info!(path = %path.display(), forwarded, "IPC writer disconnected");
        });
    }
}

async fn forward(stream: UnixStream, tx: &flume::Sender<MarketEvent>) -> u64 {
    let mut lines = BufReader::new(stream).lines();
    let mut forwarded = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "IPC read error");
                break;
            }
        };
        match parse_line(&line) {
            None => continue,
            Some(Ok(event)) => {
                if tx.send_async(event).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Some(Err(e)) => tracing::warn!(error = %e, "Malformed IPC message dropped"),
        }
    }
    forwarded
}

/// Remove the socket file left behind by `listen`.
pub fn cleanup(socket_path: &Path) {
    let _ = std::fs::remove_file(socket_path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_forwards_lines_in_order() {
        let dir = std::env::temp_dir().join(format!("clob-ipc-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed.sock");

        let (tx, rx) = flume::unbounded();
        let listener = tokio::spawn(listen(path.clone(), tx));

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        };
        stream
            .write_all(
                concat!(
                    r#"{"type":"snapshot","instrument":"a","bids":[],"asks":[],"sequence":1}"#,
                    "\n",
                    "garbage\n",
                    r#"{"type":"delta","instrument":"a","sequence":2}"#,
                    "\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        assert!(matches!(rx.recv_async().await.unwrap(), MarketEvent::Snapshot(_)));
        assert!(matches!(rx.recv_async().await.unwrap(), MarketEvent::Delta(d) if d.sequence == 2));

        listener.abort();
        cleanup(&path);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
