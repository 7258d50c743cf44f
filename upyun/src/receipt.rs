use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Metadata;

/// Upload path a `put` took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    /// Plain REST `PUT`
    Rest,
    /// Form API `POST`
    Form,
    /// Legacy multipart API
    Multipart,
    /// Resumable REST session
    Resumable,
}

/// Receipt returned after a successful `put`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub key: String,
    pub mode: UploadMode,
    /// Metadata reported by the server for the stored object
    pub metadata: Map<String, Value>,
}

impl UploadReceipt {
    pub(crate) fn from_headers(key: &str, mode: UploadMode, meta: Metadata) -> Self {
        Self {
            key: key.to_string(),
            mode,
            metadata: meta.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        }
    }

    pub(crate) fn from_json(key: &str, mode: UploadMode, metadata: Map<String, Value>) -> Self {
        Self {
            key: key.to_string(),
            mode,
            metadata,
        }
    }

    /// A metadata value rendered as text
    pub fn get(&self, name: &str) -> Option<String> {
        self.metadata.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
