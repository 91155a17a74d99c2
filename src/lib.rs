//! # hass-ws
//!
//! Persistent, push-capable WebSocket client for the Home Assistant API.
//!
//! One authenticated connection multiplexes many concurrent
//! request/response exchanges (correlated by integer `id`) and dispatches
//! long-lived server-push events to registered subscribers. Multi-phase
//! push commands such as system health are folded into a single result
//! by the aggregation service.
//!
//! ## Architecture
//!
//! ```text
//! Callers (CLI commands, scripts)
//!     │
//!     ├── AggregationService (service/)
//!     │
//!     ├── Connection::send / subscribe (ws/)
//!     │       ├── PendingRequests (correlator)
//!     │       └── SubscriptionRegistry
//!     │
//!     ├── Dispatch loop (single reader task)
//!     │
//!     └── Handshake + frame codec over tokio-tungstenite
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use hass_ws::config::ClientConfig;
//! use hass_ws::service::AggregationService;
//! use hass_ws::ws::Connection;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("http://localhost:8123", "token");
//! let url = config.websocket_url()?;
//! let conn = Arc::new(
//!     Connection::connect_with_options(&url, &config.token, config.connection_options()).await?,
//! );
//!
//! let states = conn
//!     .send("get_states", serde_json::Value::Null, Duration::from_secs(10))
//!     .await?;
//! println!("{states}");
//!
//! let health = AggregationService::new(Arc::clone(&conn), &config)
//!     .system_health()
//!     .await?;
//! println!("{health}");
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod ws;

pub use error::{ClientError, ClientResult};
