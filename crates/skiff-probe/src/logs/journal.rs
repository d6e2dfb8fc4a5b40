use crate::error::{ProbeError, ProbeResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bound for a non-follow read
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) fn validate_unit(unit: &str) -> ProbeResult<()> {
    let valid = !unit.starts_with('-')
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-' | '\\'));
    if valid {
        Ok(())
    } else {
        Err(ProbeError::Log(format!("invalid journal unit '{unit}'")))
    }
}

pub(super) async fn stream_journal(
    unit: &str,
    tail: usize,
    follow_until: Option<Instant>,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> ProbeResult<()> {
    let mut cmd = Command::new("journalctl");
    cmd.arg("-u")
        .arg(unit)
        .arg("-n")
        .arg(tail.to_string())
        .arg("--no-pager")
        .arg("-o")
        .arg("short-iso");
    if follow_until.is_some() {
        cmd.arg("-f");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ProbeError::Log(format!("cannot run journalctl: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProbeError::Log("journalctl stdout unavailable".into()))?;
    let mut lines = BufReader::new(stdout).lines();
    let deadline = follow_until.unwrap_or_else(|| Instant::now() + ONE_SHOT_TIMEOUT);

    let mut timed_out = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if tx.send(line).await.is_err() {
                        let _ = child.kill().await;
                        return Ok(());
                    }
                }
                None => break,
            },
        }
    }

    if follow_until.is_some() || cancel.is_cancelled() {
        let _ = child.kill().await;
        debug!(unit, "journal follow ended");
        return Ok(());
    }
    if timed_out {
        let _ = child.kill().await;
        return Err(ProbeError::Log(format!("journalctl for {unit} timed out")));
    }

    let status = child.wait().await?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        return Err(ProbeError::Log(format!(
            "journalctl exited with {status}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_option_like_units() {
        validate_unit("nginx.service").unwrap();
        validate_unit("getty@tty1.service").unwrap();
        assert!(validate_unit("-f").is_err());
        assert!(validate_unit("a b").is_err());
        assert!(validate_unit("x;rm").is_err());
    }
}
