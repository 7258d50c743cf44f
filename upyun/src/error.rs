use thiserror::Error;

/// Result type for UPYUN operations
pub type UpyunResult<T> = Result<T, UpyunError>;

/// Errors that can occur while talking to UPYUN.
///
/// There are exactly two kinds. Local file and JSON encoding failures
/// convert into [`UpyunError::Client`] with the original error as source.
#[derive(Error, Debug)]
pub enum UpyunError {
    /// Raised locally: bad arguments, missing credentials, transport failures
    #[error("Client error: {message}")]
    Client {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server answered with a non-2xx status, or a 2xx body that breaks
    /// the protocol.
    #[error("Service error {status} (request id {}): {message}", request_id.as_deref().unwrap_or("Unknown"))]
    Service {
        request_id: Option<String>,
        status: u16,
        message: String,
        body: String,
    },
}

impl From<std::io::Error> for UpyunError {
    fn from(error: std::io::Error) -> Self {
        Self::transport(format!("I/O error: {error}"), error)
    }
}

impl From<serde_json::Error> for UpyunError {
    fn from(error: serde_json::Error) -> Self {
        Self::transport(format!("serialization error: {error}"), error)
    }
}

impl UpyunError {
    /// Create a client-side error
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self::Client {
            message: message.into(),
            source: None,
        }
    }

    /// Create a client-side error caused by a transport failure
    pub fn transport<S, E>(message: S, error: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Client {
            message: message.into(),
            source: Some(Box::new(error)),
        }
    }

    /// Create a service error
    pub fn service<S: Into<String>>(
        request_id: Option<String>,
        status: u16,
        message: S,
        body: impl Into<String>,
    ) -> Self {
        Self::Service {
            request_id,
            status,
            message: message.into(),
            body: body.into(),
        }
    }

    /// True for errors raised before or instead of a server answer
    pub fn is_client(&self) -> bool {
        !self.is_service()
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    /// HTTP status of a service error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Service { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}
