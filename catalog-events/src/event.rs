//! Bus event types

use crate::Topic;
use catalog_core::Timestamp;
use serde::{Deserialize, Serialize};

/// Kind of bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Progress,
    Log,
    Complete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Progress => "progress",
            EventType::Log => "log",
            EventType::Complete => "complete",
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BusEvent {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub topic: Topic,
    /// Per-topic sequence number, starting at 1
    pub seq: u64,
    pub event_type: EventType,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub payload: serde_json::Value,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub emitted_at: Timestamp,
}
