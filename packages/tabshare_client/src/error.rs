use tokio_tungstenite::tungstenite;

/// Errors surfaced by the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the relay")]
    NotConnected,

    #[error("no group joined")]
    NoGroup,

    #[error("relay client has shut down")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] tabshare_protocol::ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Failures of the external classification service.
///
/// All of these degrade to the last published partition; none are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("no API credential configured")]
    MissingCredential,

    #[error("classification service not configured")]
    NotConfigured,

    #[error("classification timed out")]
    Timeout,

    #[error("classification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("classification service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("malformed classification response: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("saving local state failed: {0}")]
    Write(String),

    #[error("store writer stopped")]
    WriterStopped,
}
