//! # upyun: async client for UPYUN cloud storage
//!
//! `upyun` talks to the UPYUN object storage HTTP API: signed REST calls,
//! form uploads, multipart and resumable uploads for large files, CDN purges
//! and media pretreatment tasks.
//!
//! ## Key Features
//!
//! - **One client, explicit capabilities**: operator credentials unlock REST,
//!   resumable and pretreatment calls; the form secret unlocks form and
//!   multipart uploads. A missing credential fails before any request.
//! - **Streaming both ways**: files are sent and received in bounded chunks
//!   with optional progress callbacks.
//! - **Multipart uploads**: blocks go out through a bounded worker pool and
//!   the server's block status decides what is retried.
//! - **Resumable sessions**: persist the 36-character upload id and pick up
//!   where a crashed process stopped.
//! - **Two transports**: a minimal one-connection-per-request HTTP/1.1 client
//!   and a pooled reqwest client, selected in [`UpyunConfig`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use upyun::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> UpyunResult<()> {
//! let client = Upyun::builder("my-bucket")
//!     .operator("operator", "password")
//!     .form_secret("form-api-secret")
//!     .build()?;
//!
//! // Plain REST upload
//! client.put("/hello.txt", "Hello, world!", PutOptions::new()).await?;
//!
//! // Large file through the multipart API
//! let receipt = client
//!     .put("/video.mp4", UploadSource::file("video.mp4"), PutOptions::new().with_multipart())
//!     .await?;
//! println!("stored {} via {:?}", receipt.key, receipt.mode);
//!
//! for entry in client.list("/").await? {
//!     println!("{} {:?} {}", entry.name, entry.kind, entry.size);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Upyun                     │  ← routing, capabilities
//! ├───────────┬──────┬───────────┬───────────────┤
//! │  RestApi  │ Form │ Multipart │ Resumable ... │  ← one module per API
//! ├───────────┴──────┴───────────┴───────────────┤
//! │        sign  ·  hasher  ·  progress          │
//! ├──────────────────────────────────────────────┤
//! │  Transport (BasicTransport | PooledTransport)│
//! └──────────────────────────────────────────────┘
//! ```

mod client;
mod config;
mod error;
pub mod form;
pub mod hasher;
pub mod multipart;
pub mod pretreat;
pub mod progress;
mod receipt;
pub mod rest;
pub mod resumable;
pub mod sign;
pub mod transport;
mod types;

pub use client::{encode_path, PutOptions, Upyun, UpyunBuilder};
pub use config::{Endpoint, MultipartRules, ServiceHosts, TransportKind, UpyunConfig, USER_AGENT};
pub use error::{UpyunError, UpyunResult};
pub use form::FormUploader;
pub use multipart::{BlockStatus, MultipartState, MultipartUploader, UploadSession};
pub use pretreat::Pretreatment;
pub use progress::ProgressHandler;
pub use receipt::{UploadMode, UploadReceipt};
pub use rest::{parse_listing, RestApi, RestPut};
pub use resumable::{ResumableOptions, ResumableUpload, ResumableUploader};
pub use transport::{
    BasicTransport, Headers, HttpRequest, HttpResponse, Method, PooledTransport, RequestBody,
    Transport,
};
pub use types::{
    ByteStream, EntryKind, ListEntry, Metadata, UploadId, UploadSource, UploadedPart,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ListEntry, Metadata, ProgressHandler, PutOptions, UploadMode, UploadReceipt,
        UploadSource, Upyun, UpyunConfig, UpyunError, UpyunResult,
    };
}
