use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

use crate::{UpyunError, UpyunResult};

/// Stream of bytes for request and response bodies
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Object metadata taken from `x-upyun-*` headers, prefix stripped, lowercase keys
pub type Metadata = BTreeMap<String, String>;

/// Length of every resumable upload id
pub const UPLOAD_ID_LEN: usize = 36;

/// Server-issued id of a resumable upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    /// Accepts exactly 36 characters; anything else is a client error
    pub fn parse(id: impl Into<String>) -> UpyunResult<Self> {
        let id = id.into();
        if id.chars().count() != UPLOAD_ID_LEN {
            return Err(UpyunError::client(format!(
                "upload id must be {UPLOAD_ID_LEN} characters, got {}",
                id.chars().count()
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UploadId {
    type Error = UpyunError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry type in a directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// `F`
    Folder,
    /// `N`
    File,
}

impl EntryKind {
    pub fn code(&self) -> &'static str {
        match self {
            EntryKind::Folder => "F",
            EntryKind::File => "N",
        }
    }
}

/// One line of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix timestamp of the last modification
    pub time: i64,
}

/// A part already stored in a resumable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub id: u64,
    pub size: u64,
    pub checksum: String,
}

/// Where the bytes of a `put` come from
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File(std::path::PathBuf),
}

impl UploadSource {
    pub fn file(path: impl Into<std::path::PathBuf>) -> Self {
        Self::File(path.into())
    }
}

impl From<Bytes> for UploadSource {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for UploadSource {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for UploadSource {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}
