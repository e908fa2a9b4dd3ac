use serde::{Deserialize, Serialize};

/// Attribute map of one table item.
pub type Item = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeEventType {
    Insert,
    Modify,
    Remove,
}

/// One mutation of the table, as seen by change feed consumers.
///
/// `image` is the item after the change, or the deleted item for `Remove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table_key: String,
    pub image: Item,
    pub sequence_number: u64,
    pub event_type: ChangeEventType,
    pub partition: usize,
    /// Milliseconds since the UNIX epoch; drives age-based retention.
    pub created_at: i64,
}

/// Where a newly registered consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingPosition {
    /// Only records written after registration.
    #[serde(alias = "latest")]
    Latest,
    /// Everything still retained, oldest first.
    #[serde(alias = "trim_horizon")]
    TrimHorizon,
}
