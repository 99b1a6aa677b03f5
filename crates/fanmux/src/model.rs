use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Stable identifier for a provider backend (for example `openai`).
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Role of one prior conversation turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One prior turn handed to providers as context.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    /// Creates a history turn.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Per-request behavior knobs.
///
/// This is the one explicit configuration surface attached to a request;
/// there is no generic side-channel context object.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// System prompt forwarded to every targeted provider.
    pub system_prompt: Option<String>,
    /// A provider that produces no event within this window is failed with
    /// `ErrorKind::Timeout` instead of hanging the merged stream.
    pub inactivity_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            inactivity_timeout: Duration::from_secs(30),
        }
    }
}

/// One fan-out request: a prompt dispatched to several providers at once.
///
/// Immutable once dispatched; the multiplexer only ever reads it.
#[derive(Clone, Debug)]
pub struct Request {
    pub request_id: Uuid,
    pub prompt: String,
    /// Shared prompt history, oldest first.
    pub history: Vec<HistoryTurn>,
    /// Targeted providers in declaration order. The order is canonical: it is
    /// the round-robin order used when interleaving structured items.
    pub target_providers: Vec<ProviderId>,
    pub options: RequestOptions,
}

impl Request {
    /// Creates a request with a fresh id and default options.
    pub fn new(prompt: impl Into<String>, targets: impl IntoIterator<Item = ProviderId>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            prompt: prompt.into(),
            history: Vec::new(),
            target_providers: dedup_preserving_order(targets),
            options: RequestOptions::default(),
        }
    }
}

pub(crate) fn dedup_preserving_order(
    targets: impl IntoIterator<Item = ProviderId>,
) -> Vec<ProviderId> {
    let mut seen = std::collections::HashSet::new();
    targets
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_options_default_inactivity_window() {
        assert_eq!(
            RequestOptions::default().inactivity_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn request_new_dedups_targets_preserving_order() {
        let req = Request::new(
            "hi",
            vec![
                ProviderId::new("b"),
                ProviderId::new("a"),
                ProviderId::new("b"),
            ],
        );
        assert_eq!(
            req.target_providers,
            vec![ProviderId::new("b"), ProviderId::new("a")]
        );
    }
}
