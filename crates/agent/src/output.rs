//! JSON-lines output for emitted anomalies

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

/// Write each received item as one JSON line until the channel closes
///
/// Write and flush errors are logged and the loop keeps draining. Returns the
/// number of lines written.
pub async fn forward_json_lines<T, W>(mut items: mpsc::Receiver<T>, mut writer: W) -> usize
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(item) = items.recv().await {
        let mut line = match serde_json::to_string(&item) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize anomaly");
                continue;
            }
        };
        line.push('\n');

        match writer.write_all(line.as_bytes()).await {
            Ok(()) => written += 1,
            Err(e) => warn!(error = %e, "Failed to write anomaly"),
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Failed to flush anomaly output");
        }
    }
    written
}
