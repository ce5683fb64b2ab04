//! Catalog Events - Notification Bus
//!
//! Publishers emit `{topic, event_type, payload}`; subscribers receive the
//! events of the topics they registered for, in publish order. Delivery is
//! at-most-once: a subscriber that falls behind or disconnects misses
//! events, and a subscriber that joins late gets no history. A bounded
//! per-topic log backs the polling fallback.

pub mod bus;
pub mod event;
pub mod topic;

pub use bus::{NotificationBus, Subscription};
pub use event::{BusEvent, EventType};
pub use topic::{Topic, TopicParseError};
