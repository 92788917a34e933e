//! Writes queued documents to a local file, one JSON hit per line.

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::config::OutputFileConfig;
use crate::error::Result;
use crate::pipeline::QueueReceiver;
use crate::progress::Progress;

/// Drains the queue into `config.path` until the queue closes.
///
/// Returns the number of documents written.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub async fn write_dump(
    queue: QueueReceiver,
    config: &OutputFileConfig,
    progress: &Progress,
) -> Result<u64> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!config.truncate)
        .truncate(config.truncate)
        .open(&config.path)
        .await?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;

    while let Some(doc) = queue.recv().await {
        let mut line = serde_json::to_vec(&doc)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        progress.add_written(1);
        written += 1;
    }

    writer.flush().await?;
    info!("Wrote {} documents to {}", written, config.path.display());
    Ok(written)
}
