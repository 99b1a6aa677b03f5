use crate::errors::ErrorKind;
use crate::model::ProviderId;

/// Final per-provider statistics carried by the terminal `Done` event.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FinalStats {
    /// Vendor finish reason when the provider reported one.
    pub finish_reason: Option<String>,
    /// Structured items emitted by this provider.
    pub item_count: usize,
    /// Characters of visible content streamed.
    pub content_chars: usize,
    /// Characters of hidden reasoning streamed.
    pub thinking_chars: usize,
    /// True when the run ended because the caller cancelled it.
    pub cancelled: bool,
}

/// Events of the merged fan-out stream.
///
/// Every variant except `AllDone` names the provider it originated from, so
/// consumers can demultiplex by that field. Serialization is tagged so a
/// push transport can map each variant to one named wire event.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental visible text from one provider.
    Token { provider: ProviderId, text: String },
    /// Incremental hidden reasoning from one provider.
    ///
    /// Kept as its own variant; reasoning is never folded into `Token` text
    /// with a marker, so it survives persistence and re-parsing.
    Thinking { provider: ProviderId, text: String },
    /// One discrete, self-contained structured item from one provider.
    Item {
        provider: ProviderId,
        payload: serde_json::Value,
    },
    /// Terminal success (or cancellation, see `FinalStats::cancelled`) for one
    /// provider. Emitted exactly once per provider.
    Done {
        provider: ProviderId,
        stats: FinalStats,
    },
    /// Terminal failure for one provider. Never aborts sibling providers.
    Error {
        provider: ProviderId,
        kind: ErrorKind,
        message: String,
    },
    /// Trailing event after every targeted provider reached a terminal state.
    AllDone,
}

impl StreamEvent {
    /// Returns the originating provider, if the event has one.
    pub fn provider(&self) -> Option<&ProviderId> {
        match self {
            Self::Token { provider, .. }
            | Self::Thinking { provider, .. }
            | Self::Item { provider, .. }
            | Self::Done { provider, .. }
            | Self::Error { provider, .. } => Some(provider),
            Self::AllDone => None,
        }
    }

    /// True for the per-provider terminal variants (`Done`/`Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_done_carries_no_provider() {
        assert!(StreamEvent::AllDone.provider().is_none());
        assert!(!StreamEvent::AllDone.is_terminal());
    }

    #[test]
    fn wire_serialization_is_tagged_by_event_name() {
        let event = StreamEvent::Token {
            provider: ProviderId::new("openai"),
            text: "hi".into(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value.get("event").and_then(|v| v.as_str()), Some("token"));
        assert_eq!(
            value.get("provider").and_then(|v| v.as_str()),
            Some("openai")
        );
    }
}
