use crate::error::{ProbeError, ProbeResult};
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long an access-denied reader is skipped for a given log
pub const DENIAL_TTL: Duration = Duration::from_secs(10 * 60);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFormat {
    #[default]
    Text,
    Xml,
}

impl FromStr for EventFormat {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "text" => Ok(Self::Text),
            "xml" => Ok(Self::Xml),
            other => Err(ProbeError::Log(format!("unknown event log profile '{other}'"))),
        }
    }
}

/// External readers tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Candidate {
    Wevtutil,
    PowerShell,
}

impl Candidate {
    pub const ALL: [Candidate; 2] = [Candidate::Wevtutil, Candidate::PowerShell];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Wevtutil => "wevtutil",
            Self::PowerShell => "powershell",
        }
    }

    fn command(&self, log: &str, format: EventFormat, count: usize) -> Command {
        let mut cmd = match self {
            Self::Wevtutil => {
                let mut cmd = Command::new("wevtutil");
                let fmt = match format {
                    EventFormat::Text => "/f:text",
                    EventFormat::Xml => "/f:xml",
                };
                cmd.arg("qe")
                    .arg(log)
                    .arg(format!("/c:{count}"))
                    .arg("/rd:true")
                    .arg(fmt);
                cmd
            }
            Self::PowerShell => {
                let render = match format {
                    EventFormat::Text => "Format-List | Out-String -Width 4096",
                    EventFormat::Xml => "ForEach-Object { $_.ToXml() }",
                };
                let mut cmd = Command::new("powershell");
                cmd.arg("-NoProfile").arg("-NonInteractive").arg("-Command").arg(format!(
                    "Get-WinEvent -LogName '{log}' -MaxEvents {count} | {render}"
                ));
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

pub(super) fn validate_log_name(name: &str) -> ProbeResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(['-', '/'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(ProbeError::Log(format!("invalid event log name '{name}'")))
    }
}

pub fn is_access_denied(stderr: &str, exit_code: Option<i32>) -> bool {
    let lower = stderr.to_ascii_lowercase();
    exit_code == Some(5)
        || lower.contains("access is denied")
        || lower.contains("unauthorizedaccess")
        || lower.contains("not have permission")
}

#[derive(Debug, Default)]
struct Memo {
    denied: HashMap<(Candidate, String), Instant>,
    preferred: HashMap<String, Candidate>,
}

/// Denial cache and preferred reader per log name
#[derive(Debug, Default)]
pub struct EventlogState {
    memo: Mutex<Memo>,
}

impl EventlogState {
    fn memo(&self) -> std::sync::MutexGuard<'_, Memo> {
        match self.memo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Readers to try for `log`: last success first, recent denials skipped
    pub fn candidates(&self, log: &str, now: Instant) -> Vec<Candidate> {
        let mut memo = self.memo();
        memo.denied
            .retain(|_, at| now.saturating_duration_since(*at) < DENIAL_TTL);
        let mut order: Vec<Candidate> = Candidate::ALL.to_vec();
        if let Some(pref) = memo.preferred.get(log) {
            order.retain(|c| c != pref);
            order.insert(0, *pref);
        }
        order
            .into_iter()
            .filter(|c| !memo.denied.contains_key(&(*c, log.to_string())))
            .collect()
    }

    pub fn mark_denied(&self, candidate: Candidate, log: &str, now: Instant) {
        let mut memo = self.memo();
        memo.denied.insert((candidate, log.to_string()), now);
        if memo.preferred.get(log) == Some(&candidate) {
            memo.preferred.remove(log);
        }
    }

    pub fn mark_preferred(&self, candidate: Candidate, log: &str) {
        let mut memo = self.memo();
        memo.denied.remove(&(candidate, log.to_string()));
        memo.preferred.insert(log.to_string(), candidate);
    }
}

async fn run_candidate(
    candidate: Candidate,
    log: &str,
    format: EventFormat,
    count: usize,
    cancel: &CancellationToken,
) -> ProbeResult<Option<Output>> {
    let child = candidate.command(log, format, count).output();
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        res = tokio::time::timeout(READ_TIMEOUT, child) => match res {
            Ok(out) => Ok(Some(out.map_err(|e| {
                ProbeError::Log(format!("cannot run {}: {e}", candidate.name()))
            })?)),
            Err(_) => Err(ProbeError::Log(format!("{} timed out", candidate.name()))),
        },
    }
}

pub(super) async fn stream_eventlog(
    state: &EventlogState,
    log: &str,
    format: EventFormat,
    count: usize,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> ProbeResult<()> {
    let candidates = state.candidates(log, Instant::now());
    if candidates.is_empty() {
        return Err(ProbeError::Log(format!(
            "every reader for event log '{log}' was denied recently"
        )));
    }

    let mut last_error = None;
    for candidate in candidates {
        let output = match run_candidate(candidate, log, format, count, cancel).await {
            Ok(Some(output)) => output,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(reader = candidate.name(), error = %err, "event log reader failed");
                last_error = Some(err);
                continue;
            }
        };
        if output.status.success() {
            state.mark_preferred(candidate, log);
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_access_denied(&stderr, output.status.code()) {
            warn!(reader = candidate.name(), log, "access denied, skipping reader for a while");
            state.mark_denied(candidate, log, Instant::now());
        }
        last_error = Some(ProbeError::Log(format!(
            "{} exited with {}: {}",
            candidate.name(),
            output.status,
            stderr.trim()
        )));
    }
    Err(last_error.unwrap_or_else(|| ProbeError::Log(format!("cannot read event log '{log}'"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_readers_are_skipped_until_ttl() {
        let state = EventlogState::default();
        let t0 = Instant::now();
        assert_eq!(state.candidates("Security", t0), Candidate::ALL.to_vec());

        state.mark_denied(Candidate::Wevtutil, "Security", t0);
        assert_eq!(state.candidates("Security", t0), vec![Candidate::PowerShell]);
        // other logs are unaffected
        assert_eq!(state.candidates("System", t0), Candidate::ALL.to_vec());

        let later = t0 + DENIAL_TTL + Duration::from_secs(1);
        assert_eq!(state.candidates("Security", later), Candidate::ALL.to_vec());
    }

    #[test]
    fn preferred_reader_goes_first() {
        let state = EventlogState::default();
        let now = Instant::now();
        state.mark_preferred(Candidate::PowerShell, "Application");
        assert_eq!(
            state.candidates("Application", now),
            vec![Candidate::PowerShell, Candidate::Wevtutil]
        );

        state.mark_denied(Candidate::PowerShell, "Application", now);
        assert_eq!(state.candidates("Application", now), vec![Candidate::Wevtutil]);
    }

    #[test]
    fn recognises_access_denied() {
        assert!(is_access_denied("Failed to read events. Access is denied.", Some(1)));
        assert!(is_access_denied("", Some(5)));
        assert!(is_access_denied("UnauthorizedAccessException", None));
        assert!(!is_access_denied("The specified channel could not be found.", Some(15007)));
    }

    #[test]
    fn log_names_cannot_carry_arguments() {
        validate_log_name("Microsoft-Windows-PowerShell/Operational").unwrap();
        assert!(validate_log_name("/q:*").is_err());
        assert!(validate_log_name("App'; Remove-Item").is_err());
    }
}
