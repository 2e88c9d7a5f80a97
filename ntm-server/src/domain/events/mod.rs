pub mod value_object;

pub use value_object::{topics, DropReason, TopicGlob};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A published event with its globally assigned sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub topic: String,
    pub event_type: String,
    pub data: Value,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DroppedEventRecord {
    pub client_id: String,
    pub topic: String,
    pub reason: DropReason,
    pub first_seq: u64,
    pub last_seq: u64,
    pub count: u64,
    pub created_at: DateTime<Utc>,
}
