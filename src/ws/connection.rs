//! Authenticated connection and its dispatch loop.
//!
//! A [`Connection`] owns the write half of the transport and the shared
//! tables; a single spawned task owns the read half for the connection's
//! whole authenticated lifetime, decoding frames and routing each one to
//! the pending-request table or the subscription registry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::correlator::{PendingRequests, Reply};
use super::handshake::{self, FrameSink, FrameSource};
use super::messages::{ServerMessage, decode, encode_command};
use super::subscription::{DEFAULT_QUEUE_CAPACITY, Delivery, SubscriptionRegistry};
use crate::domain::{IdAllocator, RequestId};
use crate::error::{ClientError, ClientResult};

/// Tunables for the handshake and the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Timeout for each read during the authentication exchange.
    pub handshake_timeout: Duration,
    /// Consecutive read/decode errors after which the dispatch loop stops
    /// and the connection is marked dead. Values below 1 behave as 1.
    pub max_consecutive_errors: u32,
    /// Events buffered per subscription before new ones are dropped.
    /// Clamped into `1..=MAX_QUEUE_CAPACITY`.
    pub subscription_queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_consecutive_errors: 5,
            subscription_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// State shared between callers and the dispatch task.
struct Shared {
    sink: Mutex<FrameSink>,
    ids: IdAllocator,
    authenticated: AtomicBool,
    pending: PendingRequests,
    subscriptions: SubscriptionRegistry,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ids", &self.ids)
            .field("authenticated", &self.authenticated)
            .field("pending", &self.pending)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn write(&self, frame: String) -> ClientResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::text(frame))
            .await
            .map_err(ClientError::from)
    }

    /// Marks the connection dead and releases everything still waiting.
    async fn teardown(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        let released = self.pending.close_all().await;
        let cleared = self.subscriptions.close().await;
        if released > 0 || cleared > 0 {
            tracing::debug!(released, cleared, "released pending requests and subscriptions");
        }
    }
}

/// An authenticated, multiplexed connection to the server.
///
/// Share it behind an [`Arc`]; every method takes `&self`. Once closed
/// (explicitly, by drop, or by a fatal transport error) it is never reused:
/// every call returns [`ClientError::Closed`].
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    url: String,
    server_version: Option<String>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Opens and authenticates a connection with default options.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect_with_options`].
    pub async fn connect(url: &str, token: &str) -> ClientResult<Self> {
        Self::connect_with_options(url, token, ConnectionOptions::default()).await
    }

    /// Opens the transport, authenticates with `token` and starts the
    /// dispatch loop.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Connection`] if the transport cannot be opened or fails mid-handshake.
    /// - [`ClientError::Authentication`] if the token is rejected.
    /// - [`ClientError::Protocol`] if the server deviates from the handshake.
    /// - [`ClientError::Timeout`] if a handshake read times out.
    pub async fn connect_with_options(
        url: &str,
        token: &str,
        options: ConnectionOptions,
    ) -> ClientResult<Self> {
        tracing::info!(%url, "connecting");
        let (mut sink, mut source) = handshake::open(url).await?;
        let server_version =
            handshake::authenticate(&mut sink, &mut source, token, options.handshake_timeout)
                .await?;
        tracing::info!(
            %url,
            version = server_version.as_deref().unwrap_or("unknown"),
            "authenticated"
        );
        Ok(Self::start(url, sink, source, server_version, options))
    }

    fn start(
        url: &str,
        sink: FrameSink,
        source: FrameSource,
        server_version: Option<String>,
        options: ConnectionOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            sink: Mutex::new(sink),
            ids: IdAllocator::new(),
            authenticated: AtomicBool::new(true),
            pending: PendingRequests::new(),
            subscriptions: SubscriptionRegistry::with_capacity(
                options.subscription_queue_capacity,
            ),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch_loop(
            source,
            Arc::clone(&shared),
            shutdown_rx,
            options.max_consecutive_errors.max(1),
        ));

        Self {
            shared,
            shutdown,
            dispatch: Mutex::new(Some(handle)),
            url: url.to_string(),
            server_version,
            connected_at: Utc::now(),
        }
    }

    /// Returns `true` while the connection is authenticated and its
    /// dispatch loop is alive.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Server version announced during the handshake.
    #[must_use]
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Websocket URL this connection was opened against.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// When authentication completed.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Allocates the next correlation id on this connection.
    pub fn next_id(&self) -> RequestId {
        self.shared.ids.next_id()
    }

    /// Sends `command` with `params` and waits for its result.
    ///
    /// `params` must be a JSON object or `null`; its fields are merged into
    /// the frame next to `id` and `type`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Application`] if the server answers `success: false`.
    /// - [`ClientError::Timeout`] if no answer arrives within `timeout`.
    /// - [`ClientError::Closed`] if the connection is or becomes closed.
    /// - [`ClientError::Connection`] if the frame cannot be written.
    /// - [`ClientError::Protocol`] if `params` is not an object.
    pub async fn send(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> ClientResult<Value> {
        let id = self.next_id();
        self.send_with_id(id, command, params, timeout).await
    }

    /// Like [`Connection::send`] with a caller-allocated id, for commands
    /// whose id also keys a subscription.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`]; additionally [`ClientError::Protocol`] if
    /// `id` already has a request in flight.
    pub async fn send_with_id(
        &self,
        id: RequestId,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> ClientResult<Value> {
        if !self.is_authenticated() {
            return Err(ClientError::Closed);
        }
        let frame = encode_command(id, command, params)?;
        let rx = self.shared.pending.register(id).await?;

        tracing::debug!(%id, command, "sending command");
        if let Err(err) = self.shared.write(frame).await {
            self.shared.pending.remove(id).await;
            return Err(err);
        }
        self.shared.pending.wait(id, rx, timeout).await
    }

    /// Sends a keepalive `ping` and waits for the `pong`.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub async fn ping(&self, timeout: Duration) -> ClientResult<()> {
        self.send("ping", Value::Null, timeout).await.map(|_| ())
    }

    /// Registers `callback` for every `event` frame carrying `id`.
    ///
    /// The callback runs off the dispatch task, once per event, in arrival
    /// order. It stays registered until [`Connection::unsubscribe`] or until
    /// the connection closes.
    ///
    /// Up to [`ConnectionOptions::subscription_queue_capacity`] events are
    /// buffered while the callback is busy; further events are dropped and
    /// logged at `warn`. A callback that panics stops its delivery task and
    /// every later event for `id` is dropped.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] on a closed connection;
    /// [`ClientError::Protocol`] if `id` is already subscribed.
    pub async fn subscribe<F>(&self, id: RequestId, callback: F) -> ClientResult<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if !self.is_authenticated() {
            return Err(ClientError::Closed);
        }
        self.shared.subscriptions.subscribe(id, callback).await
    }

    /// Removes the callback for `id`. At most one event already in flight
    /// may still be delivered. Returns `false` if nothing was registered.
    pub async fn unsubscribe(&self, id: RequestId) -> bool {
        self.shared.subscriptions.unsubscribe(id).await
    }

    /// Subscribes to the server's event bus, optionally filtered by
    /// `event_type`, and returns the subscription id.
    ///
    /// # Errors
    ///
    /// Any error of [`Connection::send`]; the local registration is
    /// rolled back on failure.
    pub async fn subscribe_events<F>(
        &self,
        event_type: Option<&str>,
        callback: F,
        timeout: Duration,
    ) -> ClientResult<RequestId>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.subscribe(id, callback).await?;

        let params = event_type.map_or(Value::Null, |t| json!({ "event_type": t }));
        if let Err(err) = self
            .send_with_id(id, "subscribe_events", params, timeout)
            .await
        {
            self.unsubscribe(id).await;
            return Err(err);
        }
        Ok(id)
    }

    /// Cancels a subscription created by [`Connection::subscribe_events`].
    ///
    /// The local callback is removed first, so no further events are
    /// delivered even if the server call fails.
    ///
    /// # Errors
    ///
    /// Any error of [`Connection::send`].
    pub async fn unsubscribe_events(
        &self,
        subscription: RequestId,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.unsubscribe(subscription).await;
        self.send(
            "unsubscribe_events",
            json!({ "subscription": subscription.get() }),
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.len().await
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len().await
    }

    /// Closes the connection.
    ///
    /// Stops the dispatch loop, sends a close frame and releases every
    /// pending caller with [`ClientError::Closed`]. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let _ = self.shared.sink.lock().await.close().await;

        let handle = self.dispatch.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            tracing::info!(url = %self.url, "connection closed");
        }
        self.shared.teardown().await;
    }
}

/// Reads frames until shutdown, close, or too many consecutive errors.
///
/// Policy for read and decode errors: each one increments a counter that
/// any successfully decoded frame resets; reaching `max_errors` ends the
/// loop and the connection.
async fn dispatch_loop(
    mut source: FrameSource,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    max_errors: u32,
) {
    let mut consecutive_errors: u32 = 0;

    let reason = loop {
        let frame = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // Err: the owning Connection was dropped.
                match changed {
                    Ok(()) if !*shutdown.borrow() => continue,
                    _ => break "shutdown requested",
                }
            }
            frame = source.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => break "server closed the connection",
            Some(Ok(_)) => continue,
            None => break "transport ended",
            Some(Err(err)) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                tracing::warn!(error = %err, consecutive_errors, "websocket read failed");
                if consecutive_errors >= max_errors {
                    break "too many read errors";
                }
                continue;
            }
        };

        match decode(text.as_str()) {
            Ok(message) => {
                consecutive_errors = 0;
                route(&shared, message).await;
            }
            Err(err) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                tracing::debug!(error = %err, consecutive_errors, "undecodable frame");
                if consecutive_errors >= max_errors {
                    break "too many undecodable frames";
                }
            }
        }
    };

    tracing::info!(reason, "dispatch loop stopped");
    shared.teardown().await;
}

/// Routes one decoded message to its waiter or subscriber.
async fn route(shared: &Shared, message: ServerMessage) {
    match message {
        ServerMessage::Result {
            id,
            success,
            result,
            error,
        } => {
            let reply = Reply::Result {
                success,
                result,
                error,
            };
            if !shared.pending.resolve(id, reply).await {
                tracing::trace!(%id, "dropping result for unknown request");
            }
        }
        ServerMessage::Pong { id } => {
            if !shared.pending.resolve(id, Reply::Pong).await {
                tracing::trace!(%id, "dropping pong for unknown request");
            }
        }
        ServerMessage::Event { id, event } => {
            match shared.subscriptions.dispatch(id, event).await {
                Delivery::Queued => {}
                Delivery::Unknown => {
                    tracing::trace!(%id, "dropping event for unknown subscription");
                }
                Delivery::Full => {
                    tracing::warn!(%id, "subscriber queue full; dropping event");
                }
                Delivery::Stopped => {
                    tracing::warn!(%id, "subscriber callback stopped; dropping event");
                }
            }
        }
        other => {
            tracing::trace!(msg_type = other.type_str(), "ignoring message");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::ws::test_support::{
        TOKEN, accept_auth, connect, connect_with, eventually, hold_open, id_of, recv_json,
        send_json, send_text, serve, serve_authenticated,
    };

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn handshake_success_marks_authenticated() {
        let url = serve_authenticated(|mut ws| async move { hold_open(&mut ws).await }).await;
        let conn = connect(&url).await;
        assert!(conn.is_authenticated());
        assert_eq!(conn.server_version(), Some("2024.6.0"));
        assert_eq!(conn.url(), url);
    }

    #[tokio::test]
    async fn auth_invalid_fails_and_closes_transport() {
        let (closed_tx, closed_rx) = oneshot::channel();
        let url = serve(|mut ws| async move {
            let _ = accept_auth(&mut ws).await;
            let _ = closed_tx.send(recv_json(&mut ws).await.is_none());
        })
        .await;

        let result = Connection::connect(&url, "wrong-token").await;
        assert!(matches!(
            result,
            Err(ClientError::Authentication(ref msg)) if msg == "invalid_auth"
        ));
        assert_eq!(tokio::time::timeout(WAIT, closed_rx).await.ok(), Some(Ok(true)));
    }

    #[tokio::test]
    async fn structured_auth_invalid_message_is_used() {
        let url = serve(|mut ws| async move {
            send_json(&mut ws, json!({"type": "auth_required"})).await;
            let _ = recv_json(&mut ws).await;
            send_json(
                &mut ws,
                json!({
                    "type": "auth_invalid",
                    "error": {"code": "invalid_auth", "message": "Invalid access token"}
                }),
            )
            .await;
            hold_open(&mut ws).await;
        })
        .await;

        let result = Connection::connect(&url, TOKEN).await;
        assert_eq!(
            result.err(),
            Some(ClientError::Authentication("Invalid access token".into()))
        );
    }

    #[tokio::test]
    async fn unexpected_first_message_fails_and_closes_transport() {
        let (closed_tx, closed_rx) = oneshot::channel();
        let url = serve(|mut ws| async move {
            send_json(&mut ws, json!({"type": "result", "id": 1, "success": true})).await;
            let _ = closed_tx.send(recv_json(&mut ws).await.is_none());
        })
        .await;

        let result = Connection::connect(&url, TOKEN).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(tokio::time::timeout(WAIT, closed_rx).await.ok(), Some(Ok(true)));
    }

    #[tokio::test]
    async fn unexpected_auth_reply_is_protocol_error() {
        let url = serve(|mut ws| async move {
            send_json(&mut ws, json!({"type": "auth_required"})).await;
            let _ = recv_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "pong", "id": 1})).await;
            hold_open(&mut ws).await;
        })
        .await;

        let result = Connection::connect(&url, TOKEN).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn silent_server_times_out_handshake() {
        let url = serve(|mut ws| async move { hold_open(&mut ws).await }).await;
        let options = ConnectionOptions {
            handshake_timeout: Duration::from_millis(50),
            ..ConnectionOptions::default()
        };
        let result = Connection::connect_with_options(&url, TOKEN, options).await;
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
    }

    #[tokio::test]
    async fn extreme_option_values_still_connect_and_deliver() {
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                let target = frame.get("target").and_then(Value::as_u64).unwrap_or_default();
                send_json(&mut ws, json!({"id": target, "type": "event", "event": {"n": 1}})).await;
                send_json(&mut ws, json!({"id": id_of(&frame), "type": "result", "success": true}))
                    .await;
            }
        })
        .await;
        let options = ConnectionOptions {
            handshake_timeout: Duration::from_secs(u64::MAX),
            max_consecutive_errors: u32::MAX,
            subscription_queue_capacity: usize::MAX,
        };
        let conn = connect_with(&url, options).await;
        assert!(conn.is_authenticated());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let id = conn.next_id();
        let subscribed = conn
            .subscribe(id, move |payload| {
                let _ = seen_tx.send(payload);
            })
            .await;
        assert!(subscribed.is_ok());
        let trigger = conn.send("trigger", json!({"target": id.get()}), WAIT).await;
        assert!(trigger.is_ok());
        let first = tokio::time::timeout(WAIT, seen_rx.recv()).await;
        assert_eq!(first.ok().flatten(), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        drop(listener);

        let result = Connection::connect(&format!("ws://{addr}"), TOKEN).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn concurrent_sends_get_their_own_results() {
        const N: usize = 16;
        let url = serve_authenticated(|mut ws| async move {
            let mut requests = Vec::new();
            while requests.len() < N {
                let Some(frame) = recv_json(&mut ws).await else {
                    return;
                };
                requests.push(frame);
            }
            // Answer in reverse order so completion order differs from send order.
            for frame in requests.iter().rev() {
                send_json(
                    &mut ws,
                    json!({
                        "id": id_of(frame),
                        "type": "result",
                        "success": true,
                        "result": {"echo": frame.get("payload").cloned()}
                    }),
                )
                .await;
            }
            hold_open(&mut ws).await;
        })
        .await;

        let conn = Arc::new(connect(&url).await);
        let mut handles = Vec::new();
        for n in 0..N {
            let conn = Arc::clone(&conn);
            handles.push(tokio::spawn(async move {
                let result = conn
                    .send("echo", json!({"payload": n}), WAIT)
                    .await;
                (n, result)
            }));
        }
        for handle in handles {
            let Ok((n, result)) = handle.await else {
                panic!("send task failed");
            };
            assert_eq!(result, Ok(json!({"echo": n})));
        }
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn sequential_ids_strictly_increase() {
        let (ids_tx, mut ids_rx) = mpsc::unbounded_channel();
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                let id = id_of(&frame);
                let _ = ids_tx.send(id);
                send_json(&mut ws, json!({"id": id, "type": "result", "success": true})).await;
            }
        })
        .await;

        let conn = connect(&url).await;
        for _ in 0..5 {
            assert_eq!(conn.send("get_config", Value::Null, WAIT).await, Ok(Value::Null));
        }

        let mut previous = 0;
        for _ in 0..5 {
            let Some(id) = ids_rx.recv().await else {
                panic!("server saw fewer requests");
            };
            assert!(id > previous, "id {id} not above {previous}");
            previous = id;
        }
    }

    #[tokio::test]
    async fn failed_result_is_application_error() {
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                send_json(
                    &mut ws,
                    json!({
                        "id": id_of(&frame),
                        "type": "result",
                        "success": false,
                        "error": {"code": "unknown_command", "message": "Unknown command."}
                    }),
                )
                .await;
            }
        })
        .await;

        let conn = connect(&url).await;
        let result = conn.send("bogus", Value::Null, WAIT).await;
        assert_eq!(
            result,
            Err(ClientError::Application {
                code: "unknown_command".into(),
                message: "Unknown command.".into(),
            })
        );
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn timeout_then_late_result_is_dropped() {
        let url = serve_authenticated(|mut ws| async move {
            let Some(slow) = recv_json(&mut ws).await else {
                return;
            };
            let Some(ping) = recv_json(&mut ws).await else {
                return;
            };
            send_json(
                &mut ws,
                json!({"id": id_of(&slow), "type": "result", "success": true, "result": "late"}),
            )
            .await;
            send_json(&mut ws, json!({"id": id_of(&ping), "type": "pong"})).await;
            hold_open(&mut ws).await;
        })
        .await;

        let conn = connect(&url).await;
        let slow = conn
            .send("slow", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(slow, Err(ClientError::Timeout { .. })));
        assert_eq!(conn.pending_count().await, 0);

        assert_eq!(conn.ping(WAIT).await, Ok(()));
        assert_eq!(conn.pending_count().await, 0);
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn send_after_close_returns_closed_immediately() {
        let url = serve_authenticated(|mut ws| async move { hold_open(&mut ws).await }).await;
        let conn = connect(&url).await;
        conn.close().await;
        assert!(!conn.is_authenticated());

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            conn.send("ping", Value::Null, Duration::from_secs(30)),
        )
        .await;
        assert_eq!(result.ok(), Some(Err(ClientError::Closed)));
        assert!(matches!(
            conn.subscribe(RequestId::new(99), |_| {}).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_releases_pending_requests() {
        let url = serve_authenticated(|mut ws| async move { hold_open(&mut ws).await }).await;
        let conn = Arc::new(connect(&url).await);

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.send("never", Value::Null, Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await;

        let Ok(Ok(result)) = tokio::time::timeout(WAIT, waiter).await else {
            panic!("waiter did not finish");
        };
        assert_eq!(result, Err(ClientError::Closed));
    }

    #[tokio::test]
    async fn server_disconnect_releases_pending_requests() {
        let url = serve_authenticated(|mut ws| async move {
            let _ = recv_json(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let conn = connect(&url).await;
        let result = conn.send("doomed", Value::Null, Duration::from_secs(30)).await;
        assert_eq!(result, Err(ClientError::Closed));
        assert!(!conn.is_authenticated());
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn event_reaches_subscriber_once() {
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                let target = frame.get("target").and_then(Value::as_u64).unwrap_or_default();
                send_json(&mut ws, json!({"id": target, "type": "event", "event": {"n": 1}})).await;
                send_json(&mut ws, json!({"id": target + 1000, "type": "event", "event": {"n": 2}}))
                    .await;
                send_json(&mut ws, json!({"id": id_of(&frame), "type": "result", "success": true}))
                    .await;
            }
        })
        .await;

        let conn = connect(&url).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let id = conn.next_id();
        let subscribed = conn
            .subscribe(id, move |payload| {
                let _ = seen_tx.send(payload);
            })
            .await;
        assert!(subscribed.is_ok());

        let trigger = conn.send("trigger", json!({"target": id.get()}), WAIT).await;
        assert!(trigger.is_ok());

        let first = tokio::time::timeout(WAIT, seen_rx.recv()).await;
        assert_eq!(first.ok().flatten(), Some(json!({"n": 1})));
        let second = tokio::time::timeout(Duration::from_millis(100), seen_rx.recv()).await;
        assert!(second.is_err(), "unexpected extra callback: {second:?}");
    }

    #[tokio::test]
    async fn subscribe_events_round_trip() {
        let url = serve_authenticated(|mut ws| async move {
            let Some(sub) = recv_json(&mut ws).await else {
                return;
            };
            let sub_id = id_of(&sub);
            send_json(&mut ws, json!({"id": sub_id, "type": "result", "success": true})).await;
            send_json(
                &mut ws,
                json!({
                    "id": sub_id, "type": "event",
                    "event": {"event_type": sub.get("event_type")}
                }),
            )
            .await;

            let Some(unsub) = recv_json(&mut ws).await else {
                return;
            };
            let confirmed = unsub.get("type") == Some(&json!("unsubscribe_events"))
                && unsub.get("subscription") == Some(&json!(sub_id));
            send_json(
                &mut ws,
                json!({"id": id_of(&unsub), "type": "result", "success": confirmed}),
            )
            .await;
            hold_open(&mut ws).await;
        })
        .await;

        let conn = connect(&url).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let Ok(sub) = conn
            .subscribe_events(
                Some("state_changed"),
                move |payload| {
                    let _ = seen_tx.send(payload);
                },
                WAIT,
            )
            .await
        else {
            panic!("subscribe_events failed");
        };

        let event = tokio::time::timeout(WAIT, seen_rx.recv()).await;
        assert_eq!(
            event.ok().flatten(),
            Some(json!({"event_type": "state_changed"}))
        );

        assert_eq!(conn.unsubscribe_events(sub, WAIT).await, Ok(()));
        assert_eq!(conn.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_subscribe_events_rolls_back() {
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                send_json(
                    &mut ws,
                    json!({
                        "id": id_of(&frame), "type": "result", "success": false,
                        "error": {"code": "unauthorized", "message": "Unauthorized"}
                    }),
                )
                .await;
            }
        })
        .await;

        let conn = connect(&url).await;
        let result = conn.subscribe_events(None, |_| {}, WAIT).await;
        assert!(matches!(result, Err(ClientError::Application { .. })));
        assert_eq!(conn.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn isolated_bad_frames_are_tolerated() {
        let url = serve_authenticated(|mut ws| async move {
            while let Some(frame) = recv_json(&mut ws).await {
                send_text(&mut ws, "garbage").await;
                send_json(&mut ws, json!({"type": "mystery"})).await;
                send_text(&mut ws, "{\"no_type\": true}").await;
                send_json(&mut ws, json!({"id": id_of(&frame), "type": "pong"})).await;
            }
        })
        .await;

        let options = ConnectionOptions {
            max_consecutive_errors: 3,
            ..ConnectionOptions::default()
        };
        let conn = connect_with(&url, options).await;
        assert_eq!(conn.ping(WAIT).await, Ok(()));
        assert_eq!(conn.ping(WAIT).await, Ok(()));
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn repeated_bad_frames_end_the_connection() {
        let url = serve_authenticated(|mut ws| async move {
            for _ in 0..3 {
                send_text(&mut ws, "garbage").await;
            }
            hold_open(&mut ws).await;
        })
        .await;

        let options = ConnectionOptions {
            max_consecutive_errors: 3,
            ..ConnectionOptions::default()
        };
        let conn = connect_with(&url, options).await;
        assert!(eventually(|| !conn.is_authenticated()).await);
        assert_eq!(
            conn.send("ping", Value::Null, WAIT).await,
            Err(ClientError::Closed)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let url = serve_authenticated(|mut ws| async move { hold_open(&mut ws).await }).await;
        let conn = connect(&url).await;
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_authenticated());
    }
}
