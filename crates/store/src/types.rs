use serde::{Deserialize, Serialize};

/// Store-local message role, intentionally decoupled from controller-layer
/// role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRecord {
    User,
    Model,
}

/// One persisted message part. Text and image parts serialize as distinct
/// single-key objects so the blob stays readable and order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartRecord {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "image")]
    Image(ImageRecord),
}

/// Inline image payload, base64-encoded for the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: RoleRecord,
    pub parts: Vec<PartRecord>,
}

/// One persisted thread. Live session handles are never part of this record;
/// they are rebuilt from `history` and `system_instruction` on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub history: Vec<MessageRecord>,
}
