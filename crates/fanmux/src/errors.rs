use std::path::PathBuf;

use uuid::Uuid;

use crate::model::ProviderId;

/// Errors surfaced by a provider adapter before they are normalized into the
/// merged event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Provider returned an application-level failure (HTTP status, auth, quota).
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Provider produced no event within the configured inactivity window.
    #[error("timeout ({provider}): {message}")]
    Timeout {
        provider: ProviderId,
        message: String,
    },
    /// Provider response shape or event sequencing was invalid.
    #[error("protocol error ({provider}): {message}")]
    Protocol {
        provider: ProviderId,
        message: String,
    },
}

impl ProviderError {
    /// Creates a provider-level error.
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates an inactivity timeout error.
    pub fn timeout(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Timeout {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns the provider associated with this error.
    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::Provider { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Protocol { provider, .. } => provider,
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Provider { message, .. }
            | Self::Transport { message, .. }
            | Self::Timeout { message, .. }
            | Self::Protocol { message, .. } => message,
        }
    }
}

/// Classification carried by `StreamEvent::Error` so boundary transports can
/// name the failure without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    Transport,
    Timeout,
    Protocol,
}

impl From<&ProviderError> for ErrorKind {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::Provider { .. } => ErrorKind::Provider,
            ProviderError::Transport { .. } => ErrorKind::Transport,
            ProviderError::Timeout { .. } => ErrorKind::Timeout,
            ProviderError::Protocol { .. } => ErrorKind::Protocol,
        }
    }
}

/// Errors from the conversation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem read/write failed.
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A loaded record matched none of the recognized shapes.
    ///
    /// The caller should treat the conversation as absent, never crash.
    #[error("conversation {id} is unreadable: {reason}")]
    Unrecognized { id: Uuid, reason: String },
    /// Serializing a conversation for save failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unrecognized(id: Uuid, reason: impl Into<String>) -> Self {
        Self::Unrecognized {
            id,
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the public orchestrator API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Invalid orchestrator/provider configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid user input to the builder API.
    #[error("validation error: {0}")]
    Validation(String),
    /// Requested provider is not registered.
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: ProviderId },
    /// Conversation persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Internal invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}
