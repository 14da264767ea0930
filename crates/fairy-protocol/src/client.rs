use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::resolve_websocket_url;
use crate::error::{CallError, ConnectError};
use crate::events::{EventPayload, EventStream, SessionFilter, SubscriberRegistry};

const CONNECT_ATTEMPTS: u32 = 3;
const WEBSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;
const OUTBOUND_QUEUE: usize = 256;
const SUBSCRIBER_QUEUE: usize = 256;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Shared {
    outbound: mpsc::Sender<Message>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CallError>>>>,
    registry: SubscriberRegistry,
    disconnect: CancellationToken,
    call_timeout: Duration,
}

/// One duplex connection to the browser debug endpoint.
///
/// Cheap to clone; all clones share the channel. The send side is a single
/// writer task fed through a bounded queue, the receive side a single reader
/// task that resolves pending calls and fans events out to subscribers.
#[derive(Clone)]
pub struct CdpClient {
    shared: Arc<Shared>,
}

impl CdpClient {
    /// Connect with the default 10 s call timeout.
    pub async fn connect(endpoint: &str) -> Result<Self, ConnectError> {
        Self::connect_with_timeout(endpoint, DEFAULT_CALL_TIMEOUT).await
    }

    /// Connect, retrying transient failures with exponential backoff and
    /// re-resolving the endpoint on every attempt.
    pub async fn connect_with_timeout(
        endpoint: &str,
        call_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let mut backoff = Duration::from_secs(1);
        let mut last_error = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match Self::try_connect(endpoint, call_timeout).await {
                Ok(client) => return Ok(client),
                Err(err) if err.is_transient() && attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %err, "connect attempt failed, retrying in {:?}", backoff);
                    last_error = Some(err);
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(ConnectError::Closed))
    }

    async fn try_connect(endpoint: &str, call_timeout: Duration) -> Result<Self, ConnectError> {
        let ws_url = resolve_websocket_url(endpoint).await?;

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_BYTES);
        config.max_frame_size = Some(MAX_MESSAGE_BYTES);

        let dial = connect_async_with_config(&ws_url, Some(config), false);
        let (socket, _response) = timeout(WEBSOCKET_DIAL_TIMEOUT, dial)
            .await
            .map_err(|_| ConnectError::Unreachable(format!("{ws_url}: websocket dial timed out")))?
            .map_err(classify_handshake_error)?;

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            registry: SubscriberRegistry::new(SUBSCRIBER_QUEUE),
            disconnect: CancellationToken::new(),
            call_timeout,
        });

        tokio::spawn(write_loop(sink, outbound_rx, shared.disconnect.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        debug!(url = %ws_url, "connected to browser debug endpoint");
        Ok(Self { shared })
    }

    /// Invoke a protocol method, optionally routed to an attached session,
    /// and wait for the matching reply.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, session_id, self.shared.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Value, CallError> {
        if self.shared.disconnect.is_cancelled() {
            return Err(CallError::Disconnected);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut message = json!({"id": id, "method": method});
        if let Some(params) = params {
            message["params"] = params;
        }
        if let Some(session_id) = session_id {
            message["sessionId"] = Value::String(session_id.to_string());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending table lock")
            .insert(id, reply_tx);

        if self
            .shared
            .outbound
            .send(Message::Text(message.to_string()))
            .await
            .is_err()
        {
            self.forget_pending(id);
            return Err(CallError::Disconnected);
        }

        match timeout(call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Disconnected),
            Err(_) => {
                self.forget_pending(id);
                Err(CallError::Timeout)
            }
        }
    }

    fn forget_pending(&self, id: u64) {
        self.shared
            .pending
            .lock()
            .expect("pending table lock")
            .remove(&id);
    }

    /// Subscribe to subsequent events with the given name, filtered by
    /// session tag. The stream ends when the connection dies.
    pub fn subscribe(&self, method: &str, filter: SessionFilter) -> EventStream {
        self.shared.registry.subscribe(method, filter)
    }

    /// Token cancelled exactly once, when the channel is lost.
    pub fn disconnected(&self) -> CancellationToken {
        self.shared.disconnect.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnect.is_cancelled()
    }

    /// Events shed across all subscribers due to queue overflow.
    pub fn subscriber_drops(&self) -> u64 {
        self.shared.registry.dropped_total()
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Io(io) => ConnectError::Unreachable(io.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectError::Closed
        }
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => ConnectError::Closed,
        other => ConnectError::HandshakeFailed(other.to_string()),
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Message>,
    disconnect: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = disconnect.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "websocket send failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&shared, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "websocket receive failed");
                break;
            }
        }
    }

    // Connection is gone: fail callers, end subscriber streams, fire the
    // disconnect token exactly once.
    let drained: Vec<_> = {
        let mut pending = shared.pending.lock().expect("pending table lock");
        pending.drain().collect()
    };
    for (_, reply_tx) in drained {
        let _ = reply_tx.send(Err(CallError::Disconnected));
    }
    shared.registry.close();
    shared.disconnect.cancel();
    debug!("browser channel closed");
}

fn handle_text(shared: &Arc<Shared>, text: &str) {
    let data: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            warn!("discarding non-JSON frame from browser");
            return;
        }
    };

    if let Some(id) = data.get("id").and_then(Value::as_u64) {
        let reply_tx = shared
            .pending
            .lock()
            .expect("pending table lock")
            .remove(&id);
        let Some(reply_tx) = reply_tx else {
            return;
        };
        let outcome = if let Some(error) = data.get("error") {
            Err(CallError::Protocol {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(data.get("result").cloned().unwrap_or_else(|| json!({})))
        };
        let _ = reply_tx.send(outcome);
        return;
    }

    if let Some(method) = data.get("method").and_then(Value::as_str) {
        let event = Arc::new(EventPayload {
            method: method.to_string(),
            session_id: data
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from),
            params: data.get("params").cloned().unwrap_or_else(|| json!({})),
        });
        shared.registry.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_tests() -> (Arc<Shared>, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(8);
        let shared = Arc::new(Shared {
            outbound,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            registry: SubscriberRegistry::new(8),
            disconnect: CancellationToken::new(),
            call_timeout: Duration::from_secs(1),
        });
        (shared, rx)
    }

    #[tokio::test]
    async fn reply_resolves_matching_pending_call() {
        let (shared, _rx) = shared_for_tests();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(7, tx);

        handle_text(&shared, r#"{"id": 7, "result": {"ok": true}}"#);

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_reply_surfaces_protocol_error() {
        let (shared, _rx) = shared_for_tests();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(3, tx);

        handle_text(
            &shared,
            r#"{"id": 3, "error": {"code": -32000, "message": "No target"}}"#,
        );

        match rx.await.unwrap() {
            Err(CallError::Protocol { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "No target");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_fan_out_with_session_tags() {
        let (shared, _rx) = shared_for_tests();
        let mut tagged = shared
            .registry
            .subscribe("Runtime.consoleAPICalled", SessionFilter::Tag("S1".into()));

        handle_text(
            &shared,
            r#"{"method": "Runtime.consoleAPICalled", "sessionId": "S1", "params": {"type": "log"}}"#,
        );
        handle_text(
            &shared,
            r#"{"method": "Runtime.consoleAPICalled", "sessionId": "S2", "params": {"type": "log"}}"#,
        );
        shared.registry.close();

        let event = tagged.next().await.unwrap();
        assert_eq!(event.session_id.as_deref(), Some("S1"));
        assert!(tagged.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_reply_id_is_ignored() {
        let (shared, _rx) = shared_for_tests();
        handle_text(&shared, r#"{"id": 99, "result": {}}"#);
        assert!(shared.pending.lock().unwrap().is_empty());
    }
}
