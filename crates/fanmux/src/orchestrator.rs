use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::conversation::{Conversation, PersistedResponse};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::model::{ProviderId, Request, RequestOptions, dedup_preserving_order};
use crate::mux::{MergedStream, Multiplexer, ProviderRunState, RunStatus};
use crate::provider::ProviderAdapter;
use crate::store::ConversationStore;
use crate::stream::StreamEvent;

struct OrchestratorInner {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    /// Registration order; doubles as the canonical interleaving order when
    /// a turn does not narrow its targets.
    order: Vec<ProviderId>,
    store: Option<ConversationStore>,
    registry: Arc<CancelRegistry>,
}

/// The single entry point: fans a prompt out to providers, yields the merged
/// event stream, and persists each completed turn.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Starts a builder for registering providers.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Scopes a conversation for asking turns.
    pub fn conversation(&self, config: ConversationConfig) -> ConversationScope {
        ConversationScope {
            inner: self.inner.clone(),
            config,
        }
    }

    /// Registered provider ids, in registration order.
    pub fn providers(&self) -> &[ProviderId] {
        &self.inner.order
    }
}

/// Builder used to register provider adapters and configure persistence.
#[derive(Default)]
pub struct OrchestratorBuilder {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    state_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    /// Registers a provider adapter. One adapter per provider id.
    pub fn register_provider(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Enables conversation persistence under the given directory.
    ///
    /// Without a state dir, conversations live only in memory for the
    /// duration of each turn stream.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Builds the orchestrator, rejecting duplicate provider registrations.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut adapters = HashMap::new();
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for provider in self.providers {
            let id = provider.id();
            if !seen.insert(id.clone()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate provider registration: {id}"
                )));
            }
            order.push(id.clone());
            adapters.insert(id, provider);
        }
        let store = match self.state_dir {
            Some(dir) => Some(ConversationStore::open(dir)?),
            None => None,
        };
        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                adapters,
                order,
                store,
                registry: Arc::new(CancelRegistry::new()),
            }),
        })
    }
}

/// Identifies the conversation a turn belongs to.
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    /// Human-readable name, used when the conversation is first created.
    pub name: String,
    /// Stable id. A fresh id is generated when not provided, which makes the
    /// conversation effectively single-use unless the caller keeps the id.
    pub id: Option<Uuid>,
    /// System prompt applied to every turn of this conversation.
    pub system_prompt: Option<String>,
}

impl ConversationConfig {
    /// Creates a named conversation config.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            system_prompt: None,
        }
    }

    /// Pins the conversation id (for resuming a stored conversation).
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// A conversation bound to an orchestrator; entry point for turns.
#[derive(Clone)]
pub struct ConversationScope {
    inner: Arc<OrchestratorInner>,
    config: ConversationConfig,
}

impl ConversationScope {
    /// Starts building one fan-out turn for this conversation.
    pub fn ask(&self, prompt: impl Into<String>) -> TurnBuilder {
        TurnBuilder {
            inner: self.inner.clone(),
            config: self.config.clone(),
            prompt: prompt.into(),
            targets: None,
            inactivity_timeout: None,
        }
    }
}

/// Builder for one turn: prompt, target providers, and behavior knobs.
pub struct TurnBuilder {
    inner: Arc<OrchestratorInner>,
    config: ConversationConfig,
    prompt: String,
    targets: Option<Vec<ProviderId>>,
    inactivity_timeout: Option<Duration>,
}

impl TurnBuilder {
    /// Narrows the turn to a subset of registered providers, in the given
    /// order. Defaults to every registered provider in registration order.
    pub fn providers<I, P>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProviderId>,
    {
        self.targets = Some(dedup_preserving_order(
            providers.into_iter().map(Into::into),
        ));
        self
    }

    /// Overrides the per-provider inactivity window.
    pub fn inactivity_timeout(mut self, window: Duration) -> Self {
        self.inactivity_timeout = Some(window);
        self
    }

    /// Validates the turn and launches the fan-out.
    pub async fn start(self) -> Result<TurnStream, OrchestratorError> {
        if self.prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "prompt must not be empty".into(),
            ));
        }
        let targets = match self.targets {
            Some(targets) if targets.is_empty() => {
                return Err(OrchestratorError::Validation(
                    "provider list must not be empty".into(),
                ));
            }
            Some(targets) => targets,
            None => self.inner.order.clone(),
        };
        if targets.is_empty() {
            return Err(OrchestratorError::Config(
                "no providers are registered".into(),
            ));
        }

        let conversation_id = self.config.id.unwrap_or_else(Uuid::new_v4);
        let mut conversation = match &self.inner.store {
            Some(store) => store.load_or_new(conversation_id, &self.config.name),
            None => Conversation::with_id(conversation_id, &self.config.name),
        };
        if conversation.system_prompt.is_none() {
            conversation.system_prompt = self.config.system_prompt.clone();
        }

        let mut request = Request::new(self.prompt.clone(), targets.clone());
        request.history = conversation.history();
        request.options = RequestOptions {
            system_prompt: conversation.system_prompt.clone(),
            inactivity_timeout: self
                .inactivity_timeout
                .unwrap_or_else(|| RequestOptions::default().inactivity_timeout),
        };
        let request_id = request.request_id;
        debug!(request_id = %request_id, conversation_id = %conversation_id, targets = targets.len(), "starting turn");

        let merged = Multiplexer::new(self.inner.adapters.clone(), self.inner.registry.clone())
            .run(request)?;

        Ok(TurnStream {
            inner: self.inner,
            conversation,
            prompt: self.prompt,
            targets,
            merged,
            collected: BTreeMap::new(),
            persist_result: None,
        })
    }
}

/// Cloneable handle for stopping providers from outside the stream loop
/// (panel stop buttons and the like).
#[derive(Clone)]
pub struct CancelHandle {
    registry: Arc<CancelRegistry>,
    request_id: Uuid,
}

impl CancelHandle {
    /// Cancels one provider's run. Idempotent.
    pub fn cancel_one(&self, provider: &ProviderId) {
        self.registry.cancel(self.request_id, provider);
    }

    /// Cancels every still-active provider of this turn.
    pub fn cancel_all(&self) {
        self.registry.cancel_all(self.request_id);
    }
}

/// Final per-provider outcome of one turn, reported out-of-band from the
/// persisted conversation record.
#[derive(Clone, Debug)]
pub struct ProviderOutcome {
    pub status: RunStatus,
    pub content_chars: usize,
    pub thinking_chars: usize,
    pub item_count: usize,
    pub error: Option<(ErrorKind, String)>,
}

/// Summary returned once a turn's merged stream is exhausted.
#[derive(Clone, Debug)]
pub struct TurnReport {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub outcomes: BTreeMap<ProviderId, ProviderOutcome>,
}

/// One in-flight turn: forwards merged events, accumulates per-provider
/// state, and persists the turn when `AllDone` is observed.
///
/// The caller owns this stream outright; dropping it is the only
/// subscription cleanup there is.
pub struct TurnStream {
    inner: Arc<OrchestratorInner>,
    conversation: Conversation,
    prompt: String,
    targets: Vec<ProviderId>,
    merged: MergedStream,
    collected: BTreeMap<ProviderId, ProviderRunState>,
    persist_result: Option<Result<(), OrchestratorError>>,
}

impl TurnStream {
    /// The id of the fan-out request behind this turn.
    pub fn request_id(&self) -> Uuid {
        self.merged.request_id()
    }

    /// The id of the conversation this turn extends.
    pub fn conversation_id(&self) -> Uuid {
        self.conversation.id
    }

    /// Returns a cancel handle usable while the stream is borrowed mutably.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            registry: self.inner.registry.clone(),
            request_id: self.merged.request_id(),
        }
    }

    /// Cancels one provider's run. Idempotent.
    pub fn cancel_one(&self, provider: &ProviderId) {
        self.inner
            .registry
            .cancel(self.merged.request_id(), provider);
    }

    /// Cancels every still-active provider of this turn.
    pub fn cancel_all(&self) {
        self.inner.registry.cancel_all(self.merged.request_id());
    }

    /// Waits for and returns the next merged event.
    ///
    /// The turn is persisted as a side effect of observing `AllDone`;
    /// persistence failures are surfaced by `finish()`, not here.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.merged.next_event().await?;
        match &event {
            StreamEvent::Done { provider, .. } | StreamEvent::Error { provider, .. } => {
                if let Some(state) = self.merged.take_run_state(provider) {
                    self.collected.insert(provider.clone(), state);
                }
            }
            StreamEvent::AllDone => self.persist_turn(),
            _ => {}
        }
        Some(event)
    }

    /// Drains any remaining events and returns the turn report.
    ///
    /// Safe to call after consuming events manually with `next_event()`.
    pub async fn finish(mut self) -> Result<TurnReport, OrchestratorError> {
        while self.next_event().await.is_some() {}
        if let Some(Err(err)) = self.persist_result.take() {
            return Err(err);
        }
        let outcomes = self
            .collected
            .iter()
            .map(|(provider, state)| {
                (
                    provider.clone(),
                    ProviderOutcome {
                        status: state.status,
                        content_chars: state.accumulated_content.chars().count(),
                        thinking_chars: state.accumulated_thinking.chars().count(),
                        item_count: state.item_count,
                        error: state.error.clone(),
                    },
                )
            })
            .collect();
        Ok(TurnReport {
            request_id: self.merged.request_id(),
            conversation_id: self.conversation.id,
            outcomes,
        })
    }

    /// Appends one `PersistedResponse` per targeted provider (placeholders
    /// for providers that produced nothing) and saves the conversation.
    fn persist_turn(&mut self) {
        if self.persist_result.is_some() {
            return;
        }
        let mut responses = BTreeMap::new();
        for provider in &self.targets {
            let response = self
                .collected
                .get(provider)
                .map(|state| {
                    PersistedResponse::new(
                        state.accumulated_content.clone(),
                        state.accumulated_thinking.clone(),
                    )
                })
                .unwrap_or_else(PersistedResponse::placeholder);
            responses.insert(provider.clone(), response);
        }
        self.conversation.push_turn(self.prompt.clone(), responses);
        let result = match &self.inner.store {
            Some(store) => store.save(&self.conversation).map_err(|err| {
                warn!(conversation_id = %self.conversation.id, error = %err, "failed to persist turn");
                OrchestratorError::from(err)
            }),
            None => Ok(()),
        };
        self.persist_result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::provider::{ProviderEvent, ProviderRequest, ProviderStreamHandle};
    use futures::stream;

    struct CannedProvider {
        id: ProviderId,
        events: Vec<Result<ProviderEvent, ProviderError>>,
        delay: Option<Duration>,
    }

    impl CannedProvider {
        fn new(id: &str, events: Vec<Result<ProviderEvent, ProviderError>>) -> Self {
            Self {
                id: ProviderId::new(id),
                events,
                delay: None,
            }
        }

        fn paced(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for CannedProvider {
        fn id(&self) -> ProviderId {
            self.id.clone()
        }

        async fn start_stream(
            &self,
            _req: ProviderRequest,
        ) -> Result<ProviderStreamHandle, ProviderError> {
            let events = self.events.clone();
            match self.delay {
                None => Ok(ProviderStreamHandle::new(stream::iter(events))),
                Some(delay) => Ok(ProviderStreamHandle::new(stream::unfold(
                    events.into_iter(),
                    move |mut iter| async move {
                        let next = iter.next()?;
                        tokio::time::sleep(delay).await;
                        Some((next, iter))
                    },
                ))),
            }
        }
    }

    fn text(t: &str) -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::TextDelta { text: t.into() })
    }

    fn thinking(t: &str) -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::ThinkingDelta { text: t.into() })
    }

    fn completed() -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::Completed {
            finish_reason: Some("stop".into()),
        })
    }

    #[tokio::test]
    async fn duplicate_provider_registration_is_rejected() {
        let result = Orchestrator::builder()
            .register_provider(Arc::new(CannedProvider::new("a", vec![])))
            .register_provider(Arc::new(CannedProvider::new("a", vec![])))
            .build();
        assert!(matches!(
            result,
            Err(OrchestratorError::Config(message)) if message.contains("duplicate provider")
        ));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_starting() {
        let orch = Orchestrator::builder()
            .register_provider(Arc::new(CannedProvider::new("a", vec![completed()])))
            .build()
            .expect("build");
        let err = orch
            .conversation(ConversationConfig::named("t"))
            .ask("   ")
            .start()
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn successful_and_errored_providers_both_persist_aligned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = Orchestrator::builder()
            .register_provider(Arc::new(CannedProvider::new(
                "a",
                vec![text("Hi"), completed()],
            )))
            .register_provider(Arc::new(CannedProvider::new(
                "b",
                vec![Err(ProviderError::timeout("b", "no event within 30s"))],
            )))
            .state_dir(dir.path())
            .build()
            .expect("build");

        let conversation_id = Uuid::new_v4();
        let turn = orch
            .conversation(ConversationConfig::named("t").id(conversation_id))
            .ask("say hi")
            .start()
            .await
            .expect("start");
        let report = turn.finish().await.expect("finish");

        let a = &report.outcomes[&ProviderId::new("a")];
        assert_eq!(a.status, RunStatus::Done);
        assert_eq!(a.content_chars, 2);
        let b = &report.outcomes[&ProviderId::new("b")];
        assert_eq!(b.status, RunStatus::Errored);
        assert!(matches!(b.error, Some((ErrorKind::Timeout, _))));

        let store = ConversationStore::open(dir.path()).expect("open");
        let saved = store
            .load(conversation_id)
            .expect("load")
            .expect("present");
        assert!(saved.is_aligned());
        assert_eq!(saved.shared_user_turns, vec!["say hi"]);
        assert_eq!(
            saved.responses[&ProviderId::new("a")][0],
            PersistedResponse::new("Hi", "")
        );
        assert_eq!(
            saved.responses[&ProviderId::new("b")][0],
            PersistedResponse::placeholder()
        );
    }

    #[tokio::test]
    async fn thinking_is_persisted_separately_from_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = Orchestrator::builder()
            .register_provider(Arc::new(CannedProvider::new(
                "a",
                vec![thinking("hmm"), text("Hi"), completed()],
            )))
            .state_dir(dir.path())
            .build()
            .expect("build");
        let conversation_id = Uuid::new_v4();
        let turn = orch
            .conversation(ConversationConfig::named("t").id(conversation_id))
            .ask("think first")
            .start()
            .await
            .expect("start");
        turn.finish().await.expect("finish");

        let store = ConversationStore::open(dir.path()).expect("open");
        let saved = store
            .load(conversation_id)
            .expect("load")
            .expect("present");
        assert_eq!(
            saved.responses[&ProviderId::new("a")][0],
            PersistedResponse::new("Hi", "hmm")
        );
    }

    #[tokio::test]
    async fn cancel_one_mid_stream_spares_the_sibling() {
        let orch = Orchestrator::builder()
            .register_provider(Arc::new(
                CannedProvider::new("a", vec![text("s"), text("low"), completed()])
                    .paced(Duration::from_millis(30)),
            ))
            .register_provider(Arc::new(
                CannedProvider::new("b", vec![text("x"), text("never"), completed()])
                    .paced(Duration::from_millis(200)),
            ))
            .build()
            .expect("build");

        let mut turn = orch
            .conversation(ConversationConfig::named("t"))
            .ask("go")
            .start()
            .await
            .expect("start");

        let mut events = Vec::new();
        let mut cancelled_b = false;
        while let Some(event) = turn.next_event().await {
            if !cancelled_b {
                // First observed event: b is mid-stream, stop it.
                turn.cancel_one(&ProviderId::new("b"));
                cancelled_b = true;
            }
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Done { provider, stats } if provider.as_str() == "b" && stats.cancelled
        )));
        let a_text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { provider, text } if provider.as_str() == "a" => {
                    Some(text.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(a_text, "slow", "sibling ran to natural completion");
        assert_eq!(events.last(), Some(&StreamEvent::AllDone));

        let report = turn.finish().await.expect("finish");
        assert_eq!(
            report.outcomes[&ProviderId::new("b")].status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn narrowing_targets_leaves_other_providers_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orch = Orchestrator::builder()
            .register_provider(Arc::new(CannedProvider::new(
                "a",
                vec![text("unused"), completed()],
            )))
            .register_provider(Arc::new(CannedProvider::new(
                "b",
                vec![text("only me"), completed()],
            )))
            .state_dir(dir.path())
            .build()
            .expect("build");

        let conversation_id = Uuid::new_v4();
        let turn = orch
            .conversation(ConversationConfig::named("t").id(conversation_id))
            .ask("just b")
            .providers(["b"])
            .start()
            .await
            .expect("start");
        let report = turn.finish().await.expect("finish");
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes.contains_key(&ProviderId::new("b")));

        let store = ConversationStore::open(dir.path()).expect("open");
        let saved = store
            .load(conversation_id)
            .expect("load")
            .expect("present");
        assert!(saved.is_aligned());
        assert!(!saved.responses.contains_key(&ProviderId::new("a")));
    }

    #[tokio::test]
    async fn second_turn_reuses_persisted_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conversation_id = Uuid::new_v4();
        let build = || {
            Orchestrator::builder()
                .register_provider(Arc::new(CannedProvider::new(
                    "a",
                    vec![text("answer"), completed()],
                )))
                .state_dir(dir.path())
                .build()
                .expect("build")
        };

        let orch = build();
        let turn = orch
            .conversation(ConversationConfig::named("t").id(conversation_id))
            .ask("first question")
            .start()
            .await
            .expect("start");
        turn.finish().await.expect("finish");

        // A fresh orchestrator instance sees the stored turn.
        let orch = build();
        let turn = orch
            .conversation(ConversationConfig::named("t").id(conversation_id))
            .ask("second question")
            .start()
            .await
            .expect("start");
        let report = turn.finish().await.expect("finish");
        assert_eq!(report.conversation_id, conversation_id);

        let store = ConversationStore::open(dir.path()).expect("open");
        let saved = store
            .load(conversation_id)
            .expect("load")
            .expect("present");
        assert_eq!(
            saved.shared_user_turns,
            vec!["first question", "second question"]
        );
        assert!(saved.is_aligned());
    }
}
