/// Result alias that carries the custom [`RhythmSyncError`] type.
pub type Result<T> = std::result::Result<T, RhythmSyncError>;

/// Common error type for the core crate.
///
/// Only the edges of the engine produce these: configuration loading, wire
/// decoding and transports. The per-tick path never fails, it logs and
/// carries on.
#[derive(Debug, thiserror::Error)]
pub enum RhythmSyncError {
    /// Free-form message for conditions that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be parsed as JSON.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// A configuration value is outside its accepted range.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },
    /// A wire payload could not be decoded.
    #[error("malformed sync packet: {0}")]
    Decode(&'static str),
    /// The peer end of a transport has gone away.
    #[error("transport closed")]
    TransportClosed,
}

impl RhythmSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

impl From<&str> for RhythmSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for RhythmSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
