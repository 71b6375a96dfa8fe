use serde::{Deserialize, Deserializer, Serialize};

use crate::store::Value;

pub const REPLICATE_PATH: &str = "/replicate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationKind {
    Put,
    Delete,
}

impl ReplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

/// One accepted write, as pushed from the leader to each peer.
///
/// Wire form: `{"type":"put","key":"a","value":<json>}` or
/// `{"type":"delete","key":"a"}`. An unrecognised `type` fails to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOp {
    #[serde(rename = "type")]
    pub kind: ReplicationKind,
    pub key: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

// A JSON `null` is a legitimate value; only an absent field means "no value".
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ReplicationOp {
    pub fn put(key: String, value: Value) -> Self {
        Self {
            kind: ReplicationKind::Put,
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: String) -> Self {
        Self {
            kind: ReplicationKind::Delete,
            key,
            value: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("key must not be empty".to_string());
        }
        match (self.kind, &self.value) {
            (ReplicationKind::Put, None) => Err("put operation requires a value".to_string()),
            (ReplicationKind::Delete, Some(_)) => {
                Err("delete operation must not carry a value".to_string())
            }
            _ => Ok(()),
        }
    }
}
