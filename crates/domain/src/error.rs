/// Shared error type used across all CardFlow crates.
///
/// Retry machinery branches on [`Error::is_temporary`]: temporary kinds are
/// retried within the adapter's budget, everything else fails immediately.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    // ── Session cache ────────────────────────────────────────────────
    #[error("duplicate message")]
    DuplicateMessage,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message too long: {len} > {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("too many messages: {count} > {max}")]
    TooManyMessages { count: usize, max: usize },

    #[error("memory limit exceeded")]
    MemoryExceeded,

    #[error("max sessions limit exceeded")]
    MaxSessionsExceeded,

    // ── Orchestrator ─────────────────────────────────────────────────
    #[error("session busy: a turn is already in progress")]
    SessionBusy,

    #[error("daily message limit reached")]
    RateLimitedPerUser,

    // ── Upstream / platform HTTP ─────────────────────────────────────
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("platform API code {code}: {message}")]
    Platform { code: i64, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the retry loops may try again after this error.
    ///
    /// Mirrors the upstream taxonomy: connection failures, timeouts and
    /// rate limiting are transient; invalid config, invalid messages and
    /// malformed responses are not.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_) | Error::Timeout(_) | Error::RateLimited(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
