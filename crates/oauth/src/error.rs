use std::{error::Error as StdError, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// A stored or injected artifact failed validation. Readers absorb this
    /// and report the artifact as absent.
    #[error("invalid {artifact}: {reason}")]
    SchemaInvalid {
        artifact: &'static str,
        reason: String,
    },

    #[error("no code verifier saved for server {server}; the authorization session was never started")]
    SessionMissing { server: String },

    #[error(
        "authorization required but {source_desc} came from the environment; refusing to open a \
         browser in non-interactive mode. Refresh the injected credentials or unset them to log in \
         interactively"
    )]
    NonInteractiveMode { source_desc: &'static str },

    #[error(
        "timed out after {waited:?} waiting for {} to finish authorizing {server}",
        owner_pid.map_or_else(|| "another process".to_string(), |pid| format!("process {pid}"))
    )]
    CoordinationTimeout {
        server: String,
        /// `None` while the lock record could not be read.
        owner_pid: Option<u32>,
        waited: Duration,
    },

    /// The authorization server answered a token request with an OAuth error.
    #[error("token endpoint returned HTTP {status}: {error}{}", description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    TokenRejected {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("authorization was denied: {error}{}", description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("unknown invalidate scope `{0}` (expected all, client, tokens or verifier)")]
    UnknownInvalidateScope(String),

    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn schema(artifact: &'static str, reason: impl Into<String>) -> Self {
        Self::SchemaInvalid {
            artifact,
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the whole operation from scratch.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CoordinationTimeout { .. })
    }

    /// The server refused a refresh token (revoked, expired or already used).
    #[must_use]
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::TokenRejected { error, .. } if error == "invalid_grant")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
