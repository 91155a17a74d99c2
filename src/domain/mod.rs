//! Domain layer: correlation identifiers and the aggregation fold.
//!
//! Pure types with no I/O. The websocket layer allocates [`RequestId`]s
//! and the aggregation service drives an [`AggregationState`].

pub mod aggregation;
pub mod request_id;

pub use aggregation::{AggregationEvent, AggregationState, Step};
pub use request_id::{IdAllocator, RequestId};
