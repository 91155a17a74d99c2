//! In-process websocket server used by the connection and service tests.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use super::connection::{Connection, ConnectionOptions};

/// Token the mock server accepts.
pub(crate) const TOKEN: &str = "test-token";

/// Server side of one accepted connection.
pub(crate) type ServerStream = WebSocketStream<TcpStream>;

/// Accepts a single websocket connection and hands it to `handler`.
///
/// Returns the `ws://` URL to connect to.
pub(crate) async fn serve<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("failed to bind mock server");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("mock server has no address");
    };
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        handler(ws).await;
    });
    format!("ws://{addr}")
}

/// Like [`serve`], but completes the handshake before calling `handler`.
pub(crate) async fn serve_authenticated<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    serve(move |mut ws| async move {
        if accept_auth(&mut ws).await {
            handler(ws).await;
        }
    })
    .await
}

/// Plays the server side of the handshake, accepting [`TOKEN`].
pub(crate) async fn accept_auth(ws: &mut ServerStream) -> bool {
    send_json(ws, json!({"type": "auth_required", "ha_version": "2024.6.0"})).await;
    let Some(auth) = recv_json(ws).await else {
        return false;
    };
    let accepted = auth.get("type") == Some(&json!("auth"))
        && auth.get("access_token") == Some(&json!(TOKEN));
    if accepted {
        send_json(ws, json!({"type": "auth_ok", "ha_version": "2024.6.0"})).await;
    } else {
        send_json(ws, json!({"type": "auth_invalid", "message": "invalid_auth"})).await;
    }
    accepted
}

/// Sends one JSON text frame.
pub(crate) async fn send_json(ws: &mut ServerStream, value: Value) {
    let _ = ws.send(Message::text(value.to_string())).await;
}

/// Sends one raw text frame.
pub(crate) async fn send_text(ws: &mut ServerStream, text: &str) {
    let _ = ws.send(Message::text(text.to_string())).await;
}

/// Receives the next JSON text frame; `None` once the client is gone.
pub(crate) async fn recv_json(ws: &mut ServerStream) -> Option<Value> {
    while let Some(Ok(frame)) = ws.next().await {
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Drains frames until the client disconnects.
pub(crate) async fn hold_open(ws: &mut ServerStream) {
    while recv_json(ws).await.is_some() {}
}

/// Returns the `id` of a client command.
pub(crate) fn id_of(frame: &Value) -> u64 {
    frame.get("id").and_then(Value::as_u64).unwrap_or_default()
}

/// Connects with [`TOKEN`] and default options.
pub(crate) async fn connect(url: &str) -> Connection {
    connect_with(url, ConnectionOptions::default()).await
}

/// Connects with [`TOKEN`] and the given options.
pub(crate) async fn connect_with(url: &str, options: ConnectionOptions) -> Connection {
    match Connection::connect_with_options(url, TOKEN, options).await {
        Ok(conn) => conn,
        Err(err) => panic!("connect failed: {err}"),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
