use std::fmt;

/// Fatal, startup-time failures. Message-local failures (digest mismatch,
/// bad signature, unknown wire tag) are never represented here — they are
/// logged and dropped by the replica state machine, per the error taxonomy
/// in the design notes.
#[derive(Debug, thiserror::Error)]
pub enum PbftError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cryptographic key error: {0}")]
    Crypto(String),
}

impl PbftError {
    pub(crate) fn crypto(err: impl fmt::Display) -> Self {
        Self::Crypto(err.to_string())
    }
}
