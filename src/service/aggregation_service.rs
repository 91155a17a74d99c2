//! Aggregation service: folds a push-event stream into one result.
//!
//! Every aggregation follows the same pattern: allocate an id → subscribe
//! a queueing callback → send the command under that id → fold queued
//! events until `finish` → unsubscribe, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::domain::{AggregationEvent, AggregationState, RequestId, Step};
use crate::error::{ClientError, ClientResult};
use crate::ws::Connection;
use crate::ws::subscription::clamp_capacity;

/// Command answered by the server's system-health stream.
pub const SYSTEM_HEALTH_COMMAND: &str = "system_health/info";

/// Runs aggregation commands over a shared [`Connection`].
#[derive(Debug, Clone)]
pub struct AggregationService {
    connection: Arc<Connection>,
    confirm_timeout: Duration,
    default_timeout: Duration,
    queue_capacity: usize,
}

impl AggregationService {
    /// Creates a service using the timeouts and queue size from `config`.
    ///
    /// The queue size is clamped into `1..=MAX_QUEUE_CAPACITY`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, config: &ClientConfig) -> Self {
        Self {
            connection,
            confirm_timeout: config.subscribe_timeout,
            default_timeout: config.aggregate_timeout,
            queue_capacity: clamp_capacity(config.event_queue_capacity),
        }
    }

    /// Returns the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Runs `command_type` and folds its events into one object.
    ///
    /// `overall_timeout` bounds the whole operation: the confirmation wait
    /// uses the shorter of the configured subscribe timeout and
    /// `overall_timeout`, and the fold gets whatever time is left.
    ///
    /// Events that overflow the internal queue are dropped; aggregation is
    /// best-effort.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Application`] if the server rejects the command.
    /// - [`ClientError::Timeout`] if confirmation or the full stream takes too long.
    /// - [`ClientError::Closed`] if the connection closes before `finish`.
    pub async fn aggregate(
        &self,
        command_type: &str,
        overall_timeout: Duration,
    ) -> ClientResult<Value> {
        let id = self.connection.next_id();
        let (events_tx, mut events_rx) = mpsc::channel::<Value>(self.queue_capacity);

        self.connection
            .subscribe(id, move |payload| match events_tx.try_send(payload) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%id, "aggregation queue full; dropping event");
                }
            })
            .await?;

        let outcome = self
            .run(id, command_type, &mut events_rx, overall_timeout)
            .await;
        self.connection.unsubscribe(id).await;

        match &outcome {
            Ok(_) => tracing::debug!(%id, command = command_type, "aggregation finished"),
            Err(err) => {
                tracing::debug!(%id, command = command_type, error = %err, "aggregation failed");
            }
        }
        outcome
    }

    /// Runs the system-health aggregation with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`AggregationService::aggregate`].
    pub async fn system_health(&self) -> ClientResult<Value> {
        self.aggregate(SYSTEM_HEALTH_COMMAND, self.default_timeout)
            .await
    }

    async fn run(
        &self,
        id: RequestId,
        command_type: &str,
        events: &mut mpsc::Receiver<Value>,
        overall_timeout: Duration,
    ) -> ClientResult<Value> {
        let started = Instant::now();
        self.connection
            .send_with_id(
                id,
                command_type,
                Value::Null,
                self.confirm_timeout.min(overall_timeout),
            )
            .await?;

        let remaining = overall_timeout.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, fold_events(events))
            .await
            .map_err(|_| {
                ClientError::timeout(format!("{command_type} aggregation"), overall_timeout)
            })?
    }
}

/// Drains `events` into an [`AggregationState`] until `finish`.
async fn fold_events(events: &mut mpsc::Receiver<Value>) -> ClientResult<Value> {
    let mut state = AggregationState::new();
    while let Some(payload) = events.recv().await {
        match AggregationEvent::from_value(payload) {
            Ok(event) => {
                if state.apply(event) == Step::Finished {
                    return Ok(state.into_value());
                }
            }
            Err(err) => tracing::debug!(error = %err, "skipping malformed aggregation event"),
        }
    }
    // The subscription was dropped before `finish`: the connection closed.
    Err(ClientError::Closed)
}
