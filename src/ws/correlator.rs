//! Pending-request table for request/response correlation.
//!
//! Each in-flight command owns one single-use slot keyed by its
//! [`RequestId`]. The dispatch loop fills the slot when the matching
//! `result` or `pong` arrives; the caller empties it on timeout; closing
//! the table releases every remaining caller with [`ClientError::Closed`].

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use super::messages::ErrorBody;
use crate::domain::RequestId;
use crate::error::ClientError;

/// A response routed to a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A `result` frame.
    Result {
        /// Whether the command succeeded.
        success: bool,
        /// Payload on success.
        result: Option<Value>,
        /// Error on failure.
        error: Option<ErrorBody>,
    },
    /// A `pong` frame.
    Pong,
}

impl Reply {
    /// Converts the reply into the caller-facing outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Application`] for `success: false`.
    pub fn into_payload(self) -> Result<Value, ClientError> {
        match self {
            Self::Result {
                success: true,
                result,
                ..
            } => Ok(result.unwrap_or(Value::Null)),
            Self::Result { error, .. } => {
                let error = error.unwrap_or_default();
                Err(ClientError::Application {
                    code: if error.code.is_empty() {
                        "unknown_error".to_string()
                    } else {
                        error.code
                    },
                    message: if error.message.is_empty() {
                        "command failed".to_string()
                    } else {
                        error.message
                    },
                })
            }
            Self::Pong => Ok(Value::Null),
        }
    }
}

type Slot = oneshot::Sender<Result<Reply, ClientError>>;

/// Receiving end of a registered slot.
pub type ReplyReceiver = oneshot::Receiver<Result<Reply, ClientError>>;

#[derive(Debug, Default)]
struct Table {
    closed: bool,
    slots: HashMap<RequestId, Slot>,
}

/// Table of requests awaiting a response.
///
/// `closed` and the slots share one lock, so a registration can never
/// slip in after [`PendingRequests::close_all`] has drained the table.
#[derive(Debug, Default)]
pub struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    /// Creates an empty, open table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the table has been closed, or
    /// [`ClientError::Protocol`] if `id` already has a pending slot.
    pub async fn register(&self, id: RequestId) -> Result<ReplyReceiver, ClientError> {
        let mut table = self.table.lock().await;
        if table.closed {
            return Err(ClientError::Closed);
        }
        if table.slots.contains_key(&id) {
            return Err(ClientError::Protocol(format!("request id {id} already pending")));
        }
        let (tx, rx) = oneshot::channel();
        table.slots.insert(id, tx);
        Ok(rx)
    }

    /// Delivers `reply` to the slot for `id`, removing it.
    ///
    /// Returns `false` if no slot was registered (late arrival after a
    /// timeout, or an id this client never sent).
    pub async fn resolve(&self, id: RequestId, reply: Reply) -> bool {
        let slot = self.table.lock().await.slots.remove(&id);
        match slot {
            // The receiver may have been dropped by a caller that gave up.
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Removes the slot for `id` without delivering anything.
    pub async fn remove(&self, id: RequestId) -> bool {
        self.table.lock().await.slots.remove(&id).is_some()
    }

    /// Closes the table and releases every pending caller with
    /// [`ClientError::Closed`]. Returns how many were released.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut table = self.table.lock().await;
            table.closed = true;
            table.slots.drain().map(|(_, tx)| tx).collect()
        };
        let released = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ClientError::Closed));
        }
        released
    }

    /// Waits on `rx` for at most `timeout`, unregistering `id` on expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Application`] for a failed result,
    /// [`ClientError::Timeout`] on expiry and [`ClientError::Closed`] if
    /// the table was closed while waiting.
    pub async fn wait(
        &self,
        id: RequestId,
        rx: ReplyReceiver,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome?.into_payload(),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.remove(id).await;
                tracing::debug!(%id, ?timeout, "request timed out");
                Err(ClientError::timeout(format!("request {id}"), timeout))
            }
        }
    }

    /// Returns the number of pending requests.
    pub async fn len(&self) -> usize {
        self.table.lock().await.slots.len()
    }

    /// Returns `true` if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.slots.is_empty()
    }

    /// Returns `true` once [`PendingRequests::close_all`] has run.
    pub async fn is_closed(&self) -> bool {
        self.table.lock().await.closed
    }
}
