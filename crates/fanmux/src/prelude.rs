//! Common imports for typical usage.
//!
//! This module intentionally exports the most frequently used builder and
//! streaming types so application code needs fewer import lines.
pub use crate::{
    CancelHandle, Conversation, ConversationConfig, ErrorKind, FinalStats, HistoryTurn,
    Orchestrator, OrchestratorBuilder, OrchestratorError, PersistedResponse, ProviderAdapter,
    ProviderId, Request, Role, StreamEvent, TurnReport, TurnStream,
};
