use std::pin::Pin;
use std::time::Duration;

use uuid::Uuid;

use crate::errors::ProviderError;
use crate::model::{HistoryTurn, ProviderId};

/// Raw events produced by one provider adapter before multiplexing.
///
/// Visible content and hidden reasoning are distinct variants end to end.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// Incremental visible text.
    TextDelta { text: String },
    /// Incremental hidden reasoning text.
    ThinkingDelta { text: String },
    /// One completed structured item (a suggestion, a node, ...).
    Item { payload: serde_json::Value },
    /// Terminal success marker. The adapter stream must end after this.
    Completed { finish_reason: Option<String> },
}

/// Request handed to one provider adapter.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub request_id: Uuid,
    /// The current user prompt.
    pub prompt: String,
    /// Shared prior turns, oldest first.
    pub prior_turns: Vec<HistoryTurn>,
    pub system_prompt: Option<String>,
    /// Adapters may use this to bound their own transport reads.
    pub inactivity_timeout: Duration,
}

/// Boxed event stream returned by `ProviderAdapter::start_stream`.
///
/// The stream is finite and not restartable: it yields zero or more deltas
/// and items, then either `ProviderEvent::Completed` or an error, and is then
/// exhausted. A transport failure surfaces as exactly one `Err` item; the
/// stream never leaves the caller hanging silently.
pub struct ProviderStreamHandle {
    pub stream: Pin<Box<dyn futures::Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>,
}

impl ProviderStreamHandle {
    /// Wraps any compatible stream in a handle.
    pub fn new(
        stream: impl futures::Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static,
    ) -> Self {
        Self {
            stream: Box::pin(stream),
        }
    }
}

/// Uniform streaming contract over one model backend.
///
/// Implementations translate the provider's native wire format into
/// `ProviderEvent`s. Cancellation is cooperative: the driving task stops
/// polling and drops the handle, so adapters must not spawn detached work
/// that outlives their stream.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable id of this provider.
    fn id(&self) -> ProviderId;

    /// Starts one streaming generation call.
    async fn start_stream(&self, req: ProviderRequest)
    -> Result<ProviderStreamHandle, ProviderError>;
}
