// =============================================================================
// VISS GATEWAY — Internal error type
// =============================================================================
// Internal failures only. Client-visible failures are always rendered as the
// standard error envelope (see message.rs) at the point of detection.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// State backend failed a get/set
    #[error("state store: {0}")]
    Store(String),

    /// Access-token verifier unreachable or answered garbage
    #[error("token verifier: {0}")]
    Verifier(String),

    /// Signal tree could not be loaded or parsed
    #[error("signal tree: {0}")]
    Tree(String),

    #[error("config: {0}")]
    Config(String),

    /// Internal channel closed (owning loop gone)
    #[error("channel closed: {0}")]
    Channel(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Listener bind/accept
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
