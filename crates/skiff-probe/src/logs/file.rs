use crate::error::{ProbeError, ProbeResult};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TAIL_WINDOW_BYTES: u64 = 4 * 1024 * 1024;
const FOLLOW_POLL: Duration = Duration::from_millis(500);

async fn read_from(path: &Path, offset: u64) -> ProbeResult<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .map_err(|e| ProbeError::Log(format!("cannot open {}: {e}", path.display())))?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Last `tail` lines, then new lines until `follow_until` when set
pub(super) async fn stream_file(
    path: &Path,
    tail: usize,
    follow_until: Option<Instant>,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> ProbeResult<()> {
    let len = tokio::fs::metadata(path)
        .await
        .map_err(|e| ProbeError::Log(format!("cannot open {}: {e}", path.display())))?
        .len();
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    let head = read_from(path, start).await?;
    let mut pos = start + head.len() as u64;

    let text = String::from_utf8_lossy(&head);
    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // first line of the window is partial
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(tail);
    for line in &lines[skip..] {
        if tx.send((*line).to_string()).await.is_err() {
            return Ok(());
        }
    }

    let Some(until) = follow_until else {
        return Ok(());
    };
    let mut partial = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(until) => break,
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }
        let len = tokio::fs::metadata(path).await?.len();
        if len < pos {
            // truncated or rotated in place
            pos = 0;
            partial.clear();
        }
        if len == pos {
            continue;
        }
        let fresh = read_from(path, pos).await?;
        pos += fresh.len() as u64;
        partial.push_str(&String::from_utf8_lossy(&fresh));
        while let Some(idx) = partial.find('\n') {
            let line: String = partial.drain(..=idx).collect();
            if tx.send(line.trim_end_matches(['\r', '\n']).to_string()).await.is_err() {
                return Ok(());
            }
        }
    }
    if !partial.is_empty() {
        let _ = tx.send(partial).await;
    }
    Ok(())
}
