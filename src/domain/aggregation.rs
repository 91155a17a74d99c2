//! Fold of a push-event stream into one accumulated result.
//!
//! Aggregation commands (e.g. `system_health/info`) answer with a sequence
//! of `event` frames on a single subscription. Each event carries a
//! sub-type: `initial` seeds the accumulator, `update` fills in one
//! `(domain, key)` slot, and `finish` ends the stream.

use serde::Deserialize;
use serde_json::{Map, Value, json};

/// One event of the aggregation sub-protocol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationEvent {
    /// Seeds the accumulator; `data` is shallow-merged into the top level.
    Initial {
        /// Object whose keys are merged into the accumulator.
        #[serde(default)]
        data: Value,
    },

    /// Result of one asynchronous check.
    Update {
        /// Top-level accumulator key (integration domain).
        domain: String,
        /// Key inside the domain's `info` object.
        key: String,
        /// Whether the check succeeded.
        success: bool,
        /// Check result, present on success.
        #[serde(default)]
        data: Value,
        /// Failure description, present on failure.
        #[serde(default)]
        error: Option<Value>,
    },

    /// Terminal event.
    Finish,

    /// Sub-type this client does not know; ignored.
    #[serde(other)]
    Unknown,
}

impl AggregationEvent {
    /// Parses an event payload.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if the payload has no `type` or
    /// a known type with missing fields.
    pub fn from_value(payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More events are expected.
    Continue,
    /// The terminal event was seen.
    Finished,
}

/// Mutable accumulator for one aggregation run.
#[derive(Debug, Default, Clone)]
pub struct AggregationState {
    acc: Map<String, Value>,
}

impl AggregationState {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `event` into the accumulator.
    pub fn apply(&mut self, event: AggregationEvent) -> Step {
        match event {
            AggregationEvent::Initial { data } => {
                if let Value::Object(fields) = data {
                    self.acc.extend(fields);
                }
                Step::Continue
            }
            AggregationEvent::Update {
                domain,
                key,
                success,
                data,
                error,
            } => {
                let value = if success {
                    data
                } else {
                    json!({ "error": true, "value": error_text(error.as_ref()) })
                };
                self.set_info(domain, key, value);
                Step::Continue
            }
            AggregationEvent::Finish => Step::Finished,
            AggregationEvent::Unknown => Step::Continue,
        }
    }

    /// Sets `acc[domain].info[key] = value`, creating the path as needed.
    ///
    /// A domain entry without an `info` object is treated as a bare info
    /// map: its fields move under `info`.
    fn set_info(&mut self, domain: String, key: String, value: Value) {
        let mut entry = match self.acc.remove(&domain) {
            Some(Value::Object(entry)) => entry,
            _ => Map::new(),
        };
        let mut info = match entry.remove("info") {
            Some(Value::Object(info)) => info,
            _ => std::mem::take(&mut entry),
        };
        info.insert(key, value);
        entry.insert("info".to_string(), Value::Object(info));
        self.acc.insert(domain, Value::Object(entry));
    }

    /// Returns a view of the accumulated object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.acc
    }

    /// Consumes the accumulator, returning it as a JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.acc)
    }
}

/// Extracts a human-readable message from an `update` error payload.
fn error_text(error: Option<&Value>) -> Value {
    let text = match error {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(fields)) => fields
            .get("msg")
            .or_else(|| fields.get("message"))
            .and_then(Value::as_str),
        _ => None,
    };
    Value::String(text.unwrap_or_default().to_string())
}
