//! Log streaming for `request_log`
//!
//! A worker reads lines from one source, packs them into `log_chunk`
//! envelopes of at most `log_chunk_max_bytes` and always finishes with a
//! single `log_end`. Follow mode tails the source for at most ten minutes.

mod eventlog;
mod file;
mod journal;

pub use eventlog::{Candidate, DENIAL_TTL, EventFormat, EventlogState};

use crate::envelope::{Envelope, LOG_CHUNK, LOG_END, LogChunkPayload, LogEndPayload};
use crate::error::{ProbeError, ProbeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FOLLOW_LIMIT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TAIL_LINES: usize = 200;
pub const MAX_TAIL_LINES: usize = 5000;

/// Payload of `request_log`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    pub source: String,
    #[serde(default)]
    pub lines: Option<usize>,
    #[serde(default)]
    pub follow: bool,
}

impl LogRequest {
    pub fn tail_lines(&self) -> usize {
        self.lines.unwrap_or(DEFAULT_TAIL_LINES).clamp(1, MAX_TAIL_LINES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    File(PathBuf),
    Journal(String),
    Eventlog { name: String, format: EventFormat },
}

impl FromStr for LogSource {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| ProbeError::Log(format!("unknown log source '{s}'")))?;
        if rest.is_empty() {
            return Err(ProbeError::Log(format!("log source '{s}' has no target")));
        }
        match kind {
            "file" => Ok(Self::File(PathBuf::from(rest))),
            "journal" => {
                journal::validate_unit(rest)?;
                Ok(Self::Journal(rest.to_string()))
            }
            "eventlog" => {
                let (name, profile) = match rest.split_once(':') {
                    Some((name, profile)) => (name, profile),
                    None => (rest, ""),
                };
                eventlog::validate_log_name(name)?;
                Ok(Self::Eventlog {
                    name: name.to_string(),
                    format: profile.parse()?,
                })
            }
            other => Err(ProbeError::Log(format!("unsupported log source kind '{other}'"))),
        }
    }
}

/// Packs lines into chunks no larger than `max` bytes
#[derive(Debug)]
pub struct Chunker {
    max: usize,
    buf: String,
}

impl Chunker {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            buf: String::new(),
        }
    }

    /// Add one line; returns the chunks that became full
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        let mut record = line.trim_end_matches(['\r', '\n']).to_string();
        record.push('\n');

        let mut out = Vec::new();
        if self.buf.len() + record.len() <= self.max {
            self.buf.push_str(&record);
            return out;
        }
        if !self.buf.is_empty() {
            out.push(std::mem::take(&mut self.buf));
        }
        let mut rest = record.as_str();
        while rest.len() > self.max {
            let cut = split_point(rest, self.max);
            out.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
        self.buf.push_str(rest);
        out
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Largest char boundary not past `max`; a single wide char may exceed a tiny limit
fn split_point(s: &str, max: usize) -> usize {
    let mut cut = max.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        cut = s.chars().next().map(char::len_utf8).unwrap_or(s.len());
    }
    cut
}

/// Spawns log workers; shares the event-log reader memo across requests
#[derive(Clone, Default)]
pub struct LogStreamer {
    eventlog: Arc<EventlogState>,
}

impl LogStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eventlog_state(&self) -> &EventlogState {
        &self.eventlog
    }

    pub fn spawn(
        &self,
        request_id: Option<String>,
        request: LogRequest,
        max_chunk_bytes: usize,
        out: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let eventlog = self.eventlog.clone();
        tokio::spawn(async move {
            run_worker(eventlog, request_id, request, max_chunk_bytes, out, cancel).await;
        })
    }
}

async fn produce(
    eventlog: Arc<EventlogState>,
    source: LogSource,
    request: LogRequest,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> ProbeResult<()> {
    let follow_until = request.follow.then(|| Instant::now() + FOLLOW_LIMIT);
    let tail = request.tail_lines();
    match source {
        LogSource::File(path) => file::stream_file(&path, tail, follow_until, &tx, &cancel).await,
        LogSource::Journal(unit) => {
            journal::stream_journal(&unit, tail, follow_until, &tx, &cancel).await
        }
        LogSource::Eventlog { name, format } => {
            if request.follow {
                debug!(log = %name, "event logs are read once, ignoring follow");
            }
            eventlog::stream_eventlog(&eventlog, &name, format, tail, &tx, &cancel).await
        }
    }
}

async fn run_worker(
    eventlog: Arc<EventlogState>,
    request_id: Option<String>,
    request: LogRequest,
    max_chunk_bytes: usize,
    out: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    info!(request_id = ?request_id, source = %request.source, follow = request.follow, "log stream started");
    let mut seq: u64 = 0;
    let error = match request.source.parse::<LogSource>() {
        Err(err) => Some(err.to_string()),
        Ok(source) => {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            let producer = tokio::spawn(produce(eventlog, source, request, tx, cancel.clone()));
            let mut chunker = Chunker::new(max_chunk_bytes);
            let mut receiver_gone = false;

            'lines: while let Some(line) = rx.recv().await {
                let mut ready = chunker.push_line(&line);
                while let Ok(line) = rx.try_recv() {
                    ready.extend(chunker.push_line(&line));
                }
                // flush whenever the source goes quiet so followed lines show up promptly
                ready.extend(chunker.finish());
                for data in ready {
                    if send_chunk(&out, &request_id, &mut seq, data).await.is_err() {
                        receiver_gone = true;
                        break 'lines;
                    }
                }
            }
            if receiver_gone {
                cancel.cancel();
                producer.abort();
                debug!(request_id = ?request_id, "session closed during log stream");
                return;
            }
            match producer.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join) => Some(format!("log worker failed: {join}")),
            }
        }
    };

    if let Some(err) = &error {
        warn!(request_id = ?request_id, error = %err, "log stream failed");
    }
    let end = LogEndPayload { chunks: seq, error };
    match Envelope::with_payload(LOG_END, &end) {
        Ok(env) => {
            let _ = out.send(env.request_id(request_id.clone())).await;
        }
        Err(err) => warn!(error = %err, "cannot encode log_end"),
    }
    info!(request_id = ?request_id, chunks = seq, "log stream finished");
}

async fn send_chunk(
    out: &mpsc::Sender<Envelope>,
    request_id: &Option<String>,
    seq: &mut u64,
    data: String,
) -> Result<(), ()> {
    let payload = LogChunkPayload { seq: *seq, data };
    let env = Envelope::with_payload(LOG_CHUNK, &payload).map_err(|_| ())?;
    out.send(env.request_id(request_id.clone())).await.map_err(|_| ())?;
    *seq += 1;
    Ok(())
}
