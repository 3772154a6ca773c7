use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The frame header carried a magic value for a different network.
    #[error("wrong network magic: got {got:02x?}, expected {expected:02x?}")]
    WrongNetwork { got: [u8; 4], expected: [u8; 4] },

    #[error("malformed {command} payload: {reason}")]
    MalformedPayload {
        command: &'static str,
        reason: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl PeerError {
    pub(crate) fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        PeerError::MalformedPayload {
            command,
            reason: reason.into(),
        }
    }
}
