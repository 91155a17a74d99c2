//! Service layer: multi-step operations built on the connection primitives.

pub mod aggregation_service;

pub use aggregation_service::{AggregationService, SYSTEM_HEALTH_COMMAND};
