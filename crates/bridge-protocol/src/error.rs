use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("bridge auth error: {0}")]
    Auth(String),
    #[error("bridge rate limited: {0}")]
    RateLimited(String),
    #[error("bridge backend overloaded: {0}")]
    Overloaded(String),
    #[error("bridge backend process crashed: {0}")]
    ProcessCrash(String),
    #[error("bridge executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("bridge network error: {0}")]
    Network(String),
    #[error("bridge timeout: {0}")]
    Timeout(String),
    #[error("bridge protocol error: {0}")]
    Protocol(String),
    #[error("bridge session error: {0}")]
    Session(String),
    #[error("bridge backend error: {0}")]
    Unknown(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Auth failures must never be retried automatically; everything else is
    /// the caller's call.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
