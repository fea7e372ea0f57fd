//! Market data feeds - JSON-lines sources pushing into the engine channel
//!
//! Each line is one [`MarketEvent`](crate::orderbook::MarketEvent). A source
//! that cannot continue reports it with a `FeedFailed` event so the engine
//! stops instead of silently trading on stale books.

pub mod ipc;
pub mod replay;

use std::future::Future;

use crate::core::Result;
use crate::orderbook::MarketEvent;

/// Run a source to completion, turning an error into `FeedFailed`.
pub async fn supervise<F, T>(name: &str, tx: flume::Sender<MarketEvent>, source: F)
where
    F: Future<Output = Result<T>>,
{
    match source.await {
        Ok(_) => tracing::info!(feed = name, "Feed finished"),
        Err(e) => {
            tracing::error!(feed = name, error = %e, "Feed failed");
            let _ = tx
                .send_async(MarketEvent::FeedFailed {
                    reason: format!("{}: {}", name, e),
                })
                .await;
        }
    }
}

/// Parse one JSON line; blank lines and `#` comments yield None.
pub fn parse_line(line: &str) -> Option<serde_json::Result<MarketEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;

    #[test]
    fn test_parse_line() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("# comment").is_none());
        assert!(matches!(
            parse_line(r#"{"type":"feed_failed","reason":"x"}"#),
            Some(Ok(MarketEvent::FeedFailed { .. }))
        ));
        assert!(matches!(parse_line("{not json"), Some(Err(_))));
    }

    #[tokio::test]
    async fn test_supervise_reports_failure() {
        let (tx, rx) = flume::unbounded();
        supervise("test", tx.clone(), async {
            Err::<(), _>(Error::FeedFailed("socket gone".into()))
        })
        .await;
        match rx.recv_async().await.unwrap() {
            MarketEvent::FeedFailed { reason } => assert!(reason.contains("socket gone")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
