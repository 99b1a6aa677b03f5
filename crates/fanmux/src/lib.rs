//! Fan one prompt out to several model backends at once and consume the
//! merged, fairly interleaved event stream.
//!
//! Every targeted provider streams independently; one provider's failure or
//! cancellation never disturbs its siblings. Structured items (suggestions,
//! nodes, ...) are reordered round-robin so a fast backend cannot starve a
//! slow one, and each completed turn is persisted per provider with visible
//! content and hidden reasoning kept apart.
//!
//! # Builder-first usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fanmux::prelude::*;
//! use fanmux::vendors::openai::{OpenAiClientConfig, OpenAiProvider};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), OrchestratorError> {
//! let orchestrator = Orchestrator::builder()
//!     .register_provider(Arc::new(OpenAiProvider::from_env("gpt-5-nano")?))
//!     .register_provider(Arc::new(OpenAiProvider::new(
//!         OpenAiClientConfig::from_env("gpt-5-mini")?.provider_id("openai-mini"),
//!     )?))
//!     .state_dir("fanmux-state")
//!     .build()?;
//!
//! let mut turn = orchestrator
//!     .conversation(ConversationConfig::named("demo"))
//!     .ask("Say hello")
//!     .start()
//!     .await?;
//!
//! while let Some(event) = turn.next_event().await {
//!     if let StreamEvent::Token { provider, text } = event {
//!         print!("[{provider}] {text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Cancellation registry and tokens.
pub mod cancel;
/// Persisted conversation record and per-turn responses.
pub mod conversation;
/// Public error types.
pub mod errors;
/// Round-robin fairness buffer for structured items.
mod interleave;
/// Provider ids, request types, and request options.
pub mod model;
/// Fan-out multiplexer and the merged event stream.
pub mod mux;
/// Process-wide tracing initialization.
pub mod observability;
/// Orchestrator entry point, turn builder, and turn stream.
pub mod orchestrator;
/// Common imports for typical usage.
pub mod prelude;
/// Provider adapter contract implemented by vendor integrations.
pub mod provider;
/// Conversation persistence with legacy-shape migration.
pub mod store;
/// Merged stream events.
pub mod stream;
/// Vendor-specific integrations.
pub mod vendors;

pub use cancel::{CancelRegistry, CancelToken};
pub use conversation::{Conversation, PersistedResponse};
pub use errors::{ErrorKind, OrchestratorError, ProviderError, StoreError};
pub use model::{HistoryTurn, ProviderId, Request, RequestOptions, Role};
pub use mux::{MergedStream, Multiplexer, ProviderRunState, RunStatus};
pub use observability::init_observability;
pub use orchestrator::{
    CancelHandle, ConversationConfig, ConversationScope, Orchestrator, OrchestratorBuilder,
    ProviderOutcome, TurnBuilder, TurnReport, TurnStream,
};
pub use provider::{ProviderAdapter, ProviderEvent, ProviderRequest, ProviderStreamHandle};
pub use store::{ConversationStore, ConversationSummary};
pub use stream::{FinalStats, StreamEvent};
