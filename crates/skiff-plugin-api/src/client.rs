//! Host side of the RPC channel

use crate::capability::{AutomationClient, CoreClient, KycClient, PaymentClient, SmsClient};
use crate::protocol::{Frame, Handshake, Service};
use crate::transport::{FrameReader, FrameWriter};
use crate::{RpcError, RpcResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Outbound frames buffered before callers start waiting on the writer
const OUTBOUND_QUEUE: usize = 64;

type Reply = oneshot::Sender<RpcResult<Value>>;

/// Calls waiting for a response, keyed by request id
#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, Reply>,
    closed: Option<String>,
}

impl Pending {
    fn register(&self, id: u64, reply: Reply) -> RpcResult<()> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(RpcError::Unavailable(reason.clone()));
        }
        state.waiters.insert(id, reply);
        Ok(())
    }

    fn resolve(&self, id: u64, result: RpcResult<Value>) {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::debug!(request_id = id, "dropping response for abandoned request"),
        }
    }

    fn forget(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// Fail every in-flight call and refuse new ones
    fn close(&self, reason: &str) {
        let waiters = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            std::mem::take(&mut state.waiters)
        };
        for (_, reply) in waiters {
            let _ = reply.send(Err(RpcError::Unavailable(reason.to_string())));
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        // A poisoned map only means another caller panicked mid-insert; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a pending entry when the caller stops waiting (deadline, drop)
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

struct Inner {
    handshake: Handshake,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    outbound: mpsc::Sender<Frame>,
    reader_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.pending.close("client dropped");
    }
}

/// Multiplexed client for one plugin connection
///
/// Cheap to clone; the connection is torn down when the last clone is dropped.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("services", &self.inner.handshake.services)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Read the plugin's handshake from `reader` and start the connection tasks
    pub async fn connect<R, W>(reader: R, writer: W, handshake_timeout: Duration) -> RpcResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FrameReader::new(reader);
        let handshake = frames.read_handshake(handshake_timeout).await?;

        let pending = Arc::new(Pending::default());
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);

        tokio::spawn(write_loop(FrameWriter::new(writer), rx, pending.clone()));
        let reader_task = tokio::spawn(read_loop(frames, pending.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                handshake,
                next_id: AtomicU64::new(1),
                pending,
                outbound,
                reader_task,
            }),
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.is_closed()
    }

    /// Issue one request and decode its result
    pub async fn call<P, T>(&self, service: Service, method: &str, params: &P) -> RpcResult<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if !self.inner.handshake.advertises(service) {
            return Err(RpcError::ServiceNotAdvertised(service));
        }
        let params = serde_json::to_value(params)
            .map_err(|err| RpcError::Codec(format!("encode {service}.{method}: {err}")))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.register(id, tx)?;
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        self.inner
            .outbound
            .send(Frame::Request {
                id,
                service,
                method: method.to_string(),
                params,
            })
            .await
            .map_err(|_| RpcError::Unavailable("connection closed".to_string()))?;

        let value = rx
            .await
            .map_err(|_| RpcError::Unavailable("connection closed".to_string()))??;
        serde_json::from_value(value)
            .map_err(|err| RpcError::Codec(format!("decode {service}.{method}: {err}")))
    }

    /// Stop accepting calls and fail anything in flight
    pub fn close(&self) {
        self.inner.reader_task.abort();
        self.inner.pending.close("client closed");
    }

    pub fn dispense_core(&self) -> RpcResult<CoreClient> {
        self.require(Service::Core)?;
        Ok(CoreClient::new(self.clone()))
    }

    pub fn dispense_payment(&self) -> RpcResult<PaymentClient> {
        self.require(Service::Payment)?;
        Ok(PaymentClient::new(self.clone()))
    }

    pub fn dispense_sms(&self) -> RpcResult<SmsClient> {
        self.require(Service::Sms)?;
        Ok(SmsClient::new(self.clone()))
    }

    pub fn dispense_kyc(&self) -> RpcResult<KycClient> {
        self.require(Service::Kyc)?;
        Ok(KycClient::new(self.clone()))
    }

    pub fn dispense_automation(&self) -> RpcResult<AutomationClient> {
        self.require(Service::Automation)?;
        Ok(AutomationClient::new(self.clone()))
    }

    fn require(&self, service: Service) -> RpcResult<()> {
        if self.inner.handshake.advertises(service) {
            Ok(())
        } else {
            Err(RpcError::ServiceNotAdvertised(service))
        }
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<Frame>,
    pending: Arc<Pending>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.send(&frame).await {
            tracing::debug!(error = %err, "plugin write failed");
            pending.close(&err.to_string());
            return;
        }
    }
}

async fn read_loop<R>(mut frames: FrameReader<R>, pending: Arc<Pending>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.next().await {
            Ok(Some(Frame::Response { id, result, error })) => {
                let outcome = match error {
                    Some(status) => Err(RpcError::Status(status)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                pending.resolve(id, outcome);
            }
            Ok(Some(other)) => {
                tracing::warn!(frame = ?other, "unexpected frame from plugin");
            }
            Ok(None) => {
                pending.close("plugin closed its output");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "plugin connection failed");
                pending.close(&err.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcStatus, StatusCode};
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Raw plugin end of a connection, driven by hand
    struct FakePlugin {
        frames: FrameReader<DuplexStream>,
        writer: FrameWriter<DuplexStream>,
    }

    async fn pair(services: &[Service]) -> (RpcClient, FakePlugin) {
        let (host_read, plugin_write) = tokio::io::duplex(4096);
        let (plugin_read, host_write) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(plugin_write);
        writer
            .send(&Frame::Handshake(Handshake::current(services.iter().copied())))
            .await
            .unwrap();
        let client = RpcClient::connect(host_read, host_write, Duration::from_secs(1))
            .await
            .unwrap();
        (
            client,
            FakePlugin {
                frames: FrameReader::new(plugin_read),
                writer,
            },
        )
    }

    #[tokio::test]
    async fn responses_may_arrive_out_of_order() {
        let (client, mut plugin) = pair(&[]).await;

        let c1 = client.clone();
        let first = tokio::spawn(async move {
            c1.call::<_, Value>(Service::Core, "health", &json!({"n": 1}))
                .await
        });
        let c2 = client.clone();
        let second = tokio::spawn(async move {
            c2.call::<_, Value>(Service::Core, "health", &json!({"n": 2}))
                .await
        });

        let mut ids = Vec::new();
        for _ in 0..2 {
            match plugin.frames.next().await.unwrap() {
                Some(Frame::Request { id, params, .. }) => ids.push((id, params["n"].clone())),
                other => panic!("unexpected {other:?}"),
            }
        }
        for (id, n) in ids.into_iter().rev() {
            plugin.writer.send(&Frame::ok(id, json!({ "echo": n }))).await.unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap()["echo"], 1);
        assert_eq!(second.await.unwrap().unwrap()["echo"], 2);
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let (client, mut plugin) = pair(&[]).await;
        let call = tokio::spawn(async move {
            client
                .call::<_, Value>(Service::Core, "init", &json!({}))
                .await
        });
        let id = match plugin.frames.next().await.unwrap() {
            Some(Frame::Request { id, .. }) => id,
            other => panic!("unexpected {other:?}"),
        };
        plugin
            .writer
            .send(&Frame::err(id, RpcStatus::new(StatusCode::Internal, "boom")))
            .await
            .unwrap();
        match call.await.unwrap() {
            Err(RpcError::Status(status)) => assert_eq!(status.message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unadvertised_service_is_refused_locally() {
        let (client, _plugin) = pair(&[Service::Sms]).await;
        assert!(client.dispense_sms().is_ok());
        assert!(matches!(
            client.dispense_payment(),
            Err(RpcError::ServiceNotAdvertised(Service::Payment))
        ));
        let err = client
            .call::<_, Value>(Service::Kyc, "start", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ServiceNotAdvertised(Service::Kyc));
    }

    #[tokio::test]
    async fn plugin_exit_fails_pending_and_future_calls() {
        let (client, mut plugin) = pair(&[]).await;
        let c1 = client.clone();
        let call = tokio::spawn(async move {
            c1.call::<_, Value>(Service::Core, "health", &json!({}))
                .await
        });
        // Wait until the request is on the wire, then hang up.
        let _ = plugin.frames.next().await.unwrap();
        let FakePlugin { writer, .. } = plugin;
        drop(writer);

        assert!(matches!(call.await.unwrap(), Err(RpcError::Unavailable(_))));
        // Give the read loop a chance to observe EOF before the follow-up call.
        tokio::task::yield_now().await;
        assert!(client.is_closed());
        let err = client
            .call::<_, Value>(Service::Core, "health", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_is_removed_from_pending() {
        let (client, mut plugin) = pair(&[]).await;
        let err = crate::with_deadline(
            Duration::from_secs(2),
            client.call::<_, Value>(Service::Core, "health", &json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err, RpcError::DeadlineExceeded);
        assert!(client.inner.pending.lock().waiters.is_empty());

        // A late response is dropped without disturbing the connection.
        let id = match plugin.frames.next().await.unwrap() {
            Some(Frame::Request { id, .. }) => id,
            other => panic!("unexpected {other:?}"),
        };
        plugin.writer.send(&Frame::ok(id, json!({}))).await.unwrap();
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn connect_rejects_non_handshake_first_frame() {
        let (host_read, mut plugin_write) = tokio::io::duplex(1024);
        let (_plugin_read, host_write) = tokio::io::duplex(1024);
        plugin_write
            .write_all(b"{\"kind\":\"response\",\"id\":1}\n")
            .await
            .unwrap();
        let err = RpcClient::connect(host_read, host_write, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
