//! Transport open and authentication exchange.
//!
//! `Connecting → AwaitingAuthRequired → AuthSent → {Authenticated | AuthFailed}`.
//! Any failure closes the transport before the error is returned. No retry
//! or backoff happens here; reconnection policy belongs to the caller.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use super::messages::{AuthMessage, ServerMessage, decode};
use crate::error::ClientError;

/// Write half of the transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Read half of the transport.
pub type FrameSource = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Opens the websocket transport to `url`.
///
/// # Errors
///
/// Returns [`ClientError::Connection`] if the TCP/TLS/upgrade step fails.
pub async fn open(url: &str) -> Result<(FrameSink, FrameSource), ClientError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connection(format!("failed to connect to {url}: {e}")))?;
    let (sink, source) = stream.split();
    Ok((Box::pin(sink), Box::pin(source)))
}

/// Runs the authentication exchange over an open transport.
///
/// On success returns the server version announced during the exchange,
/// if any. On failure the transport has been closed.
///
/// # Errors
///
/// - [`ClientError::Authentication`] if the server answers `auth_invalid`.
/// - [`ClientError::Protocol`] on any unexpected message.
/// - [`ClientError::Connection`] if the transport fails or ends.
/// - [`ClientError::Timeout`] if a read exceeds `read_timeout`.
pub async fn authenticate(
    sink: &mut FrameSink,
    source: &mut FrameSource,
    token: &str,
    read_timeout: Duration,
) -> Result<Option<String>, ClientError> {
    let outcome = exchange(sink, source, token, read_timeout).await;
    if let Err(err) = &outcome {
        tracing::warn!(error = %err, "authentication failed; closing transport");
        let _ = sink.close().await;
    }
    outcome
}

async fn exchange(
    sink: &mut FrameSink,
    source: &mut FrameSource,
    token: &str,
    read_timeout: Duration,
) -> Result<Option<String>, ClientError> {
    let announced = match read_message(source, read_timeout).await? {
        ServerMessage::AuthRequired { ha_version } => ha_version,
        other => {
            return Err(ClientError::Protocol(format!(
                "expected auth_required, got {}",
                other.type_str()
            )));
        }
    };

    sink.send(Message::text(AuthMessage::new(token).to_json()?))
        .await
        .map_err(|e| ClientError::Connection(format!("failed to send auth: {e}")))?;

    match read_message(source, read_timeout).await? {
        ServerMessage::AuthOk { ha_version } => Ok(ha_version.or(announced)),
        rejected @ ServerMessage::AuthInvalid { .. } => Err(ClientError::Authentication(
            rejected
                .auth_invalid_reason()
                .unwrap_or_else(|| "invalid authentication".to_string()),
        )),
        other => Err(ClientError::Protocol(format!(
            "expected auth_ok or auth_invalid, got {}",
            other.type_str()
        ))),
    }
}

/// Reads the next application message, skipping control frames.
///
/// The whole read, control frames included, is bounded by `read_timeout`.
async fn read_message(
    source: &mut FrameSource,
    read_timeout: Duration,
) -> Result<ServerMessage, ClientError> {
    tokio::time::timeout(read_timeout, next_text(source))
        .await
        .map_err(|_| ClientError::timeout("authentication handshake", read_timeout))?
}

async fn next_text(source: &mut FrameSource) -> Result<ServerMessage, ClientError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return decode(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Connection(
                    "server closed the connection during the handshake".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ClientError::Connection(format!("handshake read failed: {e}")));
            }
        }
    }
}
