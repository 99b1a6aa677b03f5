use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{HistoryTurn, ProviderId, Role};

/// Durable unit stored per provider per turn.
///
/// Replaced wholesale when a turn completes, never partially overwritten.
/// Content and reasoning stay separate fields so neither needs re-parsing.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersistedResponse {
    pub content: String,
    pub thinking: String,
}

impl PersistedResponse {
    /// Creates a response with content and reasoning.
    pub fn new(content: impl Into<String>, thinking: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            thinking: thinking.into(),
        }
    }

    /// Placeholder entry for a provider that produced nothing this turn.
    ///
    /// Keeps every provider's response column aligned with the shared turn
    /// list even across errors and cancellations.
    pub fn placeholder() -> Self {
        Self::default()
    }

    /// True when both content and reasoning are empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty()
    }
}

/// One persisted conversation: shared user turns plus per-provider response
/// columns of equal length.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// User prompts, oldest first. Shared by every provider.
    pub shared_user_turns: Vec<String>,
    /// Per-provider responses; `responses[p].len() == shared_user_turns.len()`
    /// for every provider that has ever answered. A `BTreeMap` keeps the
    /// serialized form deterministic.
    pub responses: BTreeMap<ProviderId, Vec<PersistedResponse>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates an empty conversation with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Creates an empty conversation with a known id.
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            system_prompt: None,
            shared_user_turns: Vec::new(),
            responses: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of completed turns.
    pub fn turn_count(&self) -> usize {
        self.shared_user_turns.len()
    }

    /// Shared prompt history handed to providers for the next turn.
    pub fn history(&self) -> Vec<HistoryTurn> {
        self.shared_user_turns
            .iter()
            .map(|prompt| HistoryTurn::new(Role::User, prompt.clone()))
            .collect()
    }

    /// Appends one completed turn: the prompt plus whatever each provider
    /// produced. Every provider column is padded with placeholders so the
    /// alignment invariant holds afterwards, including providers first seen
    /// this turn and providers not targeted this turn.
    pub fn push_turn(
        &mut self,
        prompt: impl Into<String>,
        turn_responses: BTreeMap<ProviderId, PersistedResponse>,
    ) {
        let prior_turns = self.shared_user_turns.len();
        self.shared_user_turns.push(prompt.into());
        for provider in turn_responses.keys() {
            self.responses.entry(provider.clone()).or_default();
        }
        for (provider, column) in &mut self.responses {
            column.resize(prior_turns, PersistedResponse::placeholder());
            column.push(
                turn_responses
                    .get(provider)
                    .cloned()
                    .unwrap_or_else(PersistedResponse::placeholder),
            );
        }
        self.updated_at = Utc::now();
    }

    /// True when every provider column matches the shared turn list.
    pub fn is_aligned(&self) -> bool {
        self.responses
            .values()
            .all(|column| column.len() == self.shared_user_turns.len())
    }
}
