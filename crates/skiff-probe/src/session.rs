//! Agent state machine and the websocket session loop

use crate::api::{ApiClient, EnrollRequest};
use crate::config::{ProbeConfig, RuntimeConfig};
use crate::envelope::{
    self, Envelope, HEARTBEAT, HELLO, HeartbeatPayload, HelloPayload, LOG_END, LogEndPayload,
    PONG, SNAPSHOT,
};
use crate::error::{ProbeError, ProbeResult};
use crate::logs::{LogRequest, LogStreamer};
use crate::snapshot::{SnapshotSource, SystemSnapshots};
use crate::{AGENT_VERSION, tls};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unenrolled,
    Authenticating,
    Connected,
}

/// Reconnect delay: 1s doubling up to 30s
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// What a connected session needs besides the socket
#[derive(Clone)]
pub struct SessionContext {
    pub hello: HelloPayload,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub logs: LogStreamer,
}

pub struct Agent {
    config: ProbeConfig,
    config_path: Option<PathBuf>,
    api: ApiClient,
    snapshots: Arc<dyn SnapshotSource>,
    logs: LogStreamer,
    state: SessionState,
    backoff: Backoff,
}

impl Agent {
    /// `config_path` is where credentials are persisted after enrollment
    pub fn new(config: ProbeConfig, config_path: Option<PathBuf>) -> ProbeResult<Self> {
        config.validate()?;
        let api = ApiClient::new(&config.server_url, config.tls_insecure_skip_verify)?;
        let state = if config.is_enrolled() {
            SessionState::Authenticating
        } else {
            SessionState::Unenrolled
        };
        let snapshots = Arc::new(SystemSnapshots::new(config.display_name()));
        Ok(Self {
            config,
            config_path,
            api,
            snapshots,
            logs: LogStreamer::new(),
            state,
            backoff: Backoff::default(),
        })
    }

    pub fn with_snapshot_source(mut self, snapshots: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Trade the one-shot token for probe credentials and persist them
    pub async fn enroll(&mut self) -> ProbeResult<()> {
        let request = EnrollRequest {
            enroll_token: self.config.enroll_token.clone(),
            agent_id: agent_id(),
            name: self.config.display_name(),
            os_type: std::env::consts::OS.to_string(),
        };
        let response = self.api.enroll(&request).await?;
        self.config.probe_id = response.probe_id;
        self.config.probe_secret = response.probe_secret;
        self.config.enroll_token.clear();
        if let Some(path) = &self.config_path {
            self.config.save(path)?;
        }
        self.state = SessionState::Authenticating;
        info!(probe_id = self.config.probe_id, "probe enrolled");
        Ok(())
    }

    /// Run until cancelled; returns early only on errors retrying cannot fix
    pub async fn run(&mut self, cancel: CancellationToken) -> ProbeResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let result = match self.state {
                SessionState::Unenrolled => match self.enroll().await {
                    Ok(()) => continue,
                    Err(err) => Err(err),
                },
                SessionState::Authenticating | SessionState::Connected => {
                    self.connect_and_serve(&cancel).await
                }
            };
            if self.state == SessionState::Connected {
                self.state = SessionState::Authenticating;
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            match result {
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => warn!(error = %err, state = ?self.state, "probe session failed"),
                Ok(()) => info!("probe session closed"),
            }

            let delay = self.backoff.next_delay();
            debug!(delay_secs = delay.as_secs(), "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_serve(&mut self, cancel: &CancellationToken) -> ProbeResult<()> {
        self.state = SessionState::Authenticating;
        let auth = self
            .api
            .auth_token(self.config.probe_id, &self.config.probe_secret)
            .await?;
        let runtime = auth.runtime_config();

        let url = self.api.ws_url()?;
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth.access_token))
            .map_err(|e| ProbeError::Config(format!("unusable access token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        let connector = tls::ws_connector(self.config.tls_insecure_skip_verify)?;

        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                ProbeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "websocket connect timed out",
                ))
            })??;

        self.state = SessionState::Connected;
        self.backoff.reset();
        info!(%url, "probe connected");

        let ctx = SessionContext {
            hello: HelloPayload {
                probe_id: self.config.probe_id,
                agent_version: AGENT_VERSION.to_string(),
                hostname: self.config.display_name(),
                os_type: std::env::consts::OS.to_string(),
            },
            snapshots: self.snapshots.clone(),
            logs: self.logs.clone(),
        };
        run_session(ws, &ctx, runtime, cancel).await
    }
}

/// Stable machine identity when the OS offers one
fn agent_id() -> String {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn send<S>(sink: &mut S, env: &Envelope) -> ProbeResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(env.to_json()?)).await?;
    Ok(())
}

fn heartbeat(ctx: &SessionContext) -> ProbeResult<Envelope> {
    let payload = HeartbeatPayload {
        ts: chrono::Utc::now().timestamp(),
        uptime_sec: ctx.snapshots.uptime_sec(),
    };
    Envelope::with_payload(HEARTBEAT, &payload)
}

fn snapshot(ctx: &SessionContext, request_id: Option<String>) -> ProbeResult<Envelope> {
    Ok(Envelope::with_payload(SNAPSHOT, &ctx.snapshots.collect())?.request_id(request_id))
}

/// Serve one websocket until it fails or `cancel` fires
///
/// Sends `hello`, an immediate heartbeat and snapshot, then multiplexes the
/// two tickers, outbound log envelopes and inbound server envelopes.
pub async fn run_session<S>(
    ws: S,
    ctx: &SessionContext,
    mut runtime: RuntimeConfig,
    cancel: &CancellationToken,
) -> ProbeResult<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let workers = cancel.child_token();
    let _workers_guard = workers.clone().drop_guard();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);

    send(&mut sink, &Envelope::with_payload(HELLO, &ctx.hello)?).await?;
    send(&mut sink, &heartbeat(ctx)?).await?;
    send(&mut sink, &snapshot(ctx, None)?).await?;

    let mut heartbeats = ticker(runtime.heartbeat_interval());
    let mut snapshots = ticker(runtime.snapshot_interval());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeats.tick() => send(&mut sink, &heartbeat(ctx)?).await?,
            _ = snapshots.tick() => send(&mut sink, &snapshot(ctx, None)?).await?,
            Some(env) = out_rx.recv() => send(&mut sink, &env).await?,
            msg = stream.next() => {
                let text = match msg {
                    None => return Err(ProbeError::WebSocket(tungstenite::Error::ConnectionClosed)),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server closed the session");
                        return Err(ProbeError::WebSocket(tungstenite::Error::ConnectionClosed));
                    }
                    Some(Ok(_)) => continue,
                };
                let env = match Envelope::parse(text.as_str()) {
                    Ok(env) => env,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed envelope");
                        continue;
                    }
                };
                match env.kind.as_str() {
                    envelope::SET_CONFIG => {
                        let next = match RuntimeConfig::from_payload(env.payload.as_ref()) {
                            Ok(next) => next,
                            Err(err) => {
                                warn!(error = %err, "ignoring invalid set_config");
                                continue;
                            }
                        };
                        if next.heartbeat_interval() != runtime.heartbeat_interval() {
                            heartbeats = ticker(next.heartbeat_interval());
                        }
                        if next.snapshot_interval() != runtime.snapshot_interval() {
                            snapshots = ticker(next.snapshot_interval());
                        }
                        info!(
                            heartbeat_sec = next.heartbeat_interval_sec,
                            snapshot_sec = next.snapshot_interval_sec,
                            log_chunk_max_bytes = next.log_chunk_max_bytes,
                            "runtime config updated"
                        );
                        runtime = next;
                    }
                    envelope::PING => {
                        send(&mut sink, &Envelope::new(PONG).request_id(env.request_id)).await?;
                    }
                    envelope::REQUEST_SNAPSHOT | envelope::PORT_CHECK_REQUEST => {
                        send(&mut sink, &snapshot(ctx, env.request_id)?).await?;
                    }
                    envelope::REQUEST_LOG => match env.decode::<LogRequest>() {
                        Ok(request) => {
                            ctx.logs.spawn(
                                env.request_id,
                                request,
                                runtime.log_chunk_max_bytes,
                                out_tx.clone(),
                                workers.child_token(),
                            );
                        }
                        Err(err) => {
                            let end = LogEndPayload { chunks: 0, error: Some(err.to_string()) };
                            let reply = Envelope::with_payload(LOG_END, &end)?.request_id(env.request_id);
                            send(&mut sink, &reply).await?;
                        }
                    },
                    other => debug!(kind = other, "ignoring unknown envelope"),
                }
            }
        }
    }
}
