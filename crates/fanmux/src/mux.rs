use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::{CancelRegistry, CancelToken};
use crate::errors::{ErrorKind, OrchestratorError, ProviderError};
use crate::interleave::ItemInterleaver;
use crate::model::{ProviderId, Request};
use crate::provider::{ProviderAdapter, ProviderEvent, ProviderRequest};
use crate::stream::{FinalStats, StreamEvent};

/// Lifecycle of one provider inside one request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunStatus {
    Pending,
    Streaming,
    Done,
    Errored,
    Cancelled,
}

impl RunStatus {
    /// True for the three end states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }
}

/// Per-(request, provider) accumulation, owned by the merged stream for the
/// lifetime of one request and handed over when the terminal event is
/// observed.
#[derive(Clone, Debug)]
pub struct ProviderRunState {
    pub status: RunStatus,
    pub accumulated_content: String,
    pub accumulated_thinking: String,
    pub item_count: usize,
    /// Error detail for `Errored` runs, kept out of the persisted response.
    pub error: Option<(ErrorKind, String)>,
}

impl ProviderRunState {
    fn new() -> Self {
        Self {
            status: RunStatus::Pending,
            accumulated_content: String::new(),
            accumulated_thinking: String::new(),
            item_count: 0,
            error: None,
        }
    }

    fn stats(&self, finish_reason: Option<String>, cancelled: bool) -> FinalStats {
        FinalStats {
            finish_reason,
            item_count: self.item_count,
            content_chars: self.accumulated_content.chars().count(),
            thinking_chars: self.accumulated_thinking.chars().count(),
            cancelled,
        }
    }
}

/// What a producer task reports into the intake queue.
enum Intake {
    Event(ProviderId, ProviderEvent),
    Finished(ProviderId, Outcome),
}

enum Outcome {
    Completed { finish_reason: Option<String> },
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

/// Fans one request out to every targeted provider and merges the results.
///
/// One producer task per provider pushes into a shared unbounded intake
/// queue as events are produced; the consumer side demultiplexes, routes
/// structured items through the round-robin buffer, and closes with a single
/// `AllDone` once every provider reached a terminal state. One provider's
/// failure never aborts the others.
pub struct Multiplexer {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    registry: Arc<CancelRegistry>,
}

impl Multiplexer {
    pub fn new(
        adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        Self { adapters, registry }
    }

    /// Launches the fan-out and returns the merged stream.
    ///
    /// Fails fast if a targeted provider is unknown; nothing is spawned in
    /// that case.
    pub fn run(&self, request: Request) -> Result<MergedStream, OrchestratorError> {
        if request.target_providers.is_empty() {
            return Err(OrchestratorError::Validation(
                "request targets no providers".into(),
            ));
        }
        let mut targets = Vec::with_capacity(request.target_providers.len());
        for provider in &request.target_providers {
            let adapter = self.adapters.get(provider).cloned().ok_or_else(|| {
                OrchestratorError::ProviderNotFound {
                    provider: provider.clone(),
                }
            })?;
            targets.push((provider.clone(), adapter));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut states = HashMap::new();
        for (provider, adapter) in targets {
            let token = self.registry.register(request.request_id, &provider);
            states.insert(provider.clone(), ProviderRunState::new());
            let provider_request = ProviderRequest {
                request_id: request.request_id,
                prompt: request.prompt.clone(),
                prior_turns: request.history.clone(),
                system_prompt: request.options.system_prompt.clone(),
                inactivity_timeout: request.options.inactivity_timeout,
            };
            tokio::spawn(producer_task(
                adapter,
                provider.clone(),
                provider_request,
                tx.clone(),
                token,
            ));
        }
        drop(tx);

        Ok(MergedStream {
            request_id: request.request_id,
            rx,
            interleaver: ItemInterleaver::new(&request.target_providers),
            states,
            pending: VecDeque::new(),
            deferred_terminals: Vec::new(),
            remaining: request.target_providers.len(),
            registry: self.registry.clone(),
            finished: false,
        })
    }
}

/// Consumer side of one fan-out request.
///
/// Within one provider, event order is preserved exactly as produced; across
/// providers only the structured-item round-robin constrains relative order.
pub struct MergedStream {
    request_id: Uuid,
    rx: mpsc::UnboundedReceiver<Intake>,
    interleaver: ItemInterleaver,
    states: HashMap<ProviderId, ProviderRunState>,
    pending: VecDeque<StreamEvent>,
    /// Terminal events held back while their provider still has items parked
    /// in the interleaver, so a provider's items always precede its terminal.
    deferred_terminals: Vec<(ProviderId, StreamEvent)>,
    remaining: usize,
    registry: Arc<CancelRegistry>,
    finished: bool,
}

impl MergedStream {
    /// Returns the id of the request this stream serves.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Waits for and returns the next merged event.
    ///
    /// Yields exactly one `Done`/`Error` per targeted provider, then one
    /// `AllDone`, then `None`.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            if self.remaining == 0 {
                debug_assert!(self.interleaver.is_empty());
                self.finished = true;
                return Some(StreamEvent::AllDone);
            }
            match self.rx.recv().await {
                Some(intake) => self.ingest(intake),
                None => self.fail_missing_producers(),
            }
        }
    }

    /// Hands over the run state for a provider whose terminal event has been
    /// observed. The multiplexer keeps nothing for that provider afterwards.
    pub fn take_run_state(&mut self, provider: &ProviderId) -> Option<ProviderRunState> {
        self.states.remove(provider)
    }

    fn state_mut(&mut self, provider: &ProviderId) -> &mut ProviderRunState {
        self.states
            .entry(provider.clone())
            .or_insert_with(ProviderRunState::new)
    }

    fn ingest(&mut self, intake: Intake) {
        match intake {
            Intake::Event(provider, ProviderEvent::TextDelta { text }) => {
                if text.is_empty() {
                    return;
                }
                let state = self.state_mut(&provider);
                state.status = RunStatus::Streaming;
                state.accumulated_content.push_str(&text);
                self.pending.push_back(StreamEvent::Token { provider, text });
            }
            Intake::Event(provider, ProviderEvent::ThinkingDelta { text }) => {
                if text.is_empty() {
                    return;
                }
                let state = self.state_mut(&provider);
                state.status = RunStatus::Streaming;
                state.accumulated_thinking.push_str(&text);
                self.pending
                    .push_back(StreamEvent::Thinking { provider, text });
            }
            Intake::Event(provider, ProviderEvent::Item { payload }) => {
                let state = self.state_mut(&provider);
                state.status = RunStatus::Streaming;
                state.item_count += 1;
                let released = self.interleaver.push(&provider, payload);
                self.release_items(released);
            }
            // Completed inside the event stream is normalized by the
            // producer task; reaching here means a producer bug.
            Intake::Event(provider, ProviderEvent::Completed { .. }) => {
                warn!(request_id = %self.request_id, provider = %provider, "stray Completed event in intake");
            }
            Intake::Finished(provider, outcome) => self.finish_provider(provider, outcome),
        }
    }

    fn finish_provider(&mut self, provider: ProviderId, outcome: Outcome) {
        let released = self.interleaver.seal(&provider);
        let state = self.state_mut(&provider);
        let event = match outcome {
            Outcome::Completed { finish_reason } => {
                state.status = RunStatus::Done;
                let stats = state.stats(finish_reason, false);
                StreamEvent::Done {
                    provider: provider.clone(),
                    stats,
                }
            }
            Outcome::Cancelled => {
                state.status = RunStatus::Cancelled;
                let stats = state.stats(None, true);
                StreamEvent::Done {
                    provider: provider.clone(),
                    stats,
                }
            }
            Outcome::Failed { kind, message } => {
                state.status = RunStatus::Errored;
                state.error = Some((kind, message.clone()));
                StreamEvent::Error {
                    provider: provider.clone(),
                    kind,
                    message,
                }
            }
        };
        self.registry.discard(self.request_id, &provider);
        self.deferred_terminals.push((provider, event));
        self.release_items(released);
    }

    /// Forwards released items, then any held-back terminal whose provider
    /// no longer has items parked in the interleaver.
    fn release_items(&mut self, released: Vec<(ProviderId, serde_json::Value)>) {
        for (owner, payload) in released {
            self.pending.push_back(StreamEvent::Item {
                provider: owner,
                payload,
            });
        }
        let deferred = std::mem::take(&mut self.deferred_terminals);
        for (provider, event) in deferred {
            if self.interleaver.lane_is_empty(&provider) {
                self.pending.push_back(event);
                self.remaining = self.remaining.saturating_sub(1);
            } else {
                self.deferred_terminals.push((provider, event));
            }
        }
    }

    /// All producer handles dropped before reporting terminals. Should not
    /// happen; fail the stragglers instead of hanging the stream.
    fn fail_missing_producers(&mut self) {
        let stragglers: Vec<ProviderId> = self
            .states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(p, _)| p.clone())
            .collect();
        warn!(request_id = %self.request_id, count = stragglers.len(), "producer tasks vanished without terminal events");
        for provider in stragglers {
            self.finish_provider(
                provider,
                Outcome::Failed {
                    kind: ErrorKind::Protocol,
                    message: "producer task ended without a terminal event".into(),
                },
            );
        }
        self.remaining = 0;
    }
}

/// Drives one provider adapter and feeds the intake queue.
///
/// Observes the cancel token at every suspension point and enforces the
/// inactivity window around each read, so a dead provider can never hang the
/// merged stream.
async fn producer_task(
    adapter: Arc<dyn ProviderAdapter>,
    provider: ProviderId,
    request: ProviderRequest,
    tx: mpsc::UnboundedSender<Intake>,
    mut token: CancelToken,
) {
    let request_id = request.request_id;
    let window = request.inactivity_timeout;
    debug!(request_id = %request_id, provider = %provider, "starting provider stream");

    let mut handle = tokio::select! {
        biased;
        _ = token.cancelled() => {
            let _ = tx.send(Intake::Finished(provider, Outcome::Cancelled));
            return;
        }
        started = adapter.start_stream(request) => match started {
            Ok(handle) => handle,
            Err(err) => {
                let _ = tx.send(Intake::Finished(
                    provider,
                    Outcome::Failed { kind: ErrorKind::from(&err), message: err.message().to_string() },
                ));
                return;
            }
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(request_id = %request_id, provider = %provider, "provider stream cancelled");
                let _ = tx.send(Intake::Finished(provider, Outcome::Cancelled));
                return;
            }
            next = tokio::time::timeout(window, handle.stream.next()) => next,
        };
        match next {
            Err(_elapsed) => {
                let err = ProviderError::timeout(
                    provider.clone(),
                    format!("no event within {}s", window.as_secs()),
                );
                let _ = tx.send(Intake::Finished(
                    provider,
                    Outcome::Failed {
                        kind: ErrorKind::Timeout,
                        message: err.message().to_string(),
                    },
                ));
                return;
            }
            Ok(Some(Ok(ProviderEvent::Completed { finish_reason }))) => {
                debug!(request_id = %request_id, provider = %provider, "provider stream completed");
                let _ = tx.send(Intake::Finished(provider, Outcome::Completed { finish_reason }));
                return;
            }
            Ok(Some(Ok(event))) => {
                if tx.send(Intake::Event(provider.clone(), event)).is_err() {
                    return;
                }
            }
            Ok(Some(Err(err))) => {
                let _ = tx.send(Intake::Finished(
                    provider,
                    Outcome::Failed {
                        kind: ErrorKind::from(&err),
                        message: err.message().to_string(),
                    },
                ));
                return;
            }
            Ok(None) => {
                let _ = tx.send(Intake::Finished(
                    provider,
                    Outcome::Failed {
                        kind: ErrorKind::Protocol,
                        message: "provider stream ended without completion".into(),
                    },
                ));
                return;
            }
        }
    }
}
