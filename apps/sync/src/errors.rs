use thiserror::Error;

/// Sync-engine error type.
/// Library code returns `Result<T, SyncError>`; the binary wraps it in `anyhow` at its boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level failure with no HTTP response (DNS, refused connection, timeout).
    /// The poll loop retries these forever with capped backoff.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// The workspace endpoint answered with a status outside 2xx/304/404.
    /// Retried like a transport failure; the status is kept for diagnostics.
    #[error("workspace endpoint returned status {status}")]
    Http { status: u16 },

    /// Ciphertext too short, authentication tag mismatch, non-JSON plaintext,
    /// or an envelope claiming an unknown encryption format.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Payload could not be sanitized or serialized for the wire.
    /// Fatal to the single write that produced it; never retried automatically.
    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport {
            message: err.to_string(),
        }
    }
}
