//! Error types for kaos-match.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MatchError>;

/// Errors raised by the match engine, its handler hosts and host functions.
///
/// The type is `Clone` so it can travel through a scripting runtime as an
/// external error and be recovered unchanged on the other side.
#[derive(Error, Debug, Clone)]
pub enum MatchError {
    /// Init returned an unusable configuration (tick rate, label).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A handler return value or host function argument had the wrong shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Broadcast, kick or label update attempted after the match stopped.
    #[error("match stopped")]
    Stopped,

    /// Lifecycle call made while the match is in the wrong state.
    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// Error raised by the handler itself.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("inbound queue full")]
    QueueFull,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("match not found: {0}")]
    NotFound(String),

    #[error("router error: {0}")]
    Router(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Lua error: {0}")]
    #[cfg(feature = "lua")]
    Lua(#[from] mlua::Error),
}

impl MatchError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn lifecycle(reason: impl Into<String>) -> Self {
        Self::Lifecycle(reason.into())
    }

    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler(reason.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Whether the error must tear the match down rather than just fail the call.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::QueueFull | Self::NotFound(_) | Self::Timeout(_))
    }
}

#[cfg(feature = "lua")]
impl MatchError {
    /// Recover an engine error that crossed the Lua boundary as an external
    /// error. Anything raised by the script itself becomes a handler error.
    pub fn from_lua(err: mlua::Error) -> Self {
        fn find(err: &mlua::Error) -> Option<MatchError> {
            match err {
                mlua::Error::CallbackError { cause, .. } => find(cause),
                mlua::Error::WithContext { cause, .. } => find(cause),
                mlua::Error::ExternalError(inner) => inner.downcast_ref::<MatchError>().cloned(),
                _ => None,
            }
        }
        find(&err).unwrap_or_else(|| Self::Handler(err.to_string()))
    }

    /// Wrap for raising inside a Lua callback.
    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::external(self)
    }
}

impl From<std::io::Error> for MatchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
