use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by the relay server and client transport.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("relay connection closed")]
    Closed,
}
