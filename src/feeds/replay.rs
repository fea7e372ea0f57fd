//! Replay a recorded JSON-lines market data file.

use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::parse_line;
use crate::core::{Error, Result};
use crate::orderbook::MarketEvent;

/// Send every event in `path`, waiting `pace` between events when set.
/// Returns the number of events sent.
pub async fn replay_file(
    path: &Path,
    tx: flume::Sender<MarketEvent>,
    pace: Option<Duration>,
) -> Result<u64> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let event = match parse_line(&line) {
            None => continue,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed replay line");
                continue;
            }
        };
        tx.send_async(event).await.map_err(|_| Error::FeedClosed)?;
        sent += 1;
        if let Some(pace) = pace {
            tokio::time::sleep(pace).await;
        }
    }

    tracing::info!(path = %path.display(), events = sent, "Replay complete");
    Ok(sent)
}
