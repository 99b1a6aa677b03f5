use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{OrchestratorError, ProviderError};
use crate::model::{ProviderId, Role};
use crate::provider::{ProviderAdapter, ProviderEvent, ProviderRequest, ProviderStreamHandle};

use super::config::OpenAiClientConfig;
use super::transport::{SseDecoder, decode_frame};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Streaming adapter over an OpenAI-compatible responses endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiClientConfig,
}

impl OpenAiProvider {
    /// Creates an adapter from explicit client configuration.
    pub fn new(config: OpenAiClientConfig) -> Result<Self, OrchestratorError> {
        if config.api_key.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "OpenAI client config api_key must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OrchestratorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates an adapter using `OPENAI_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, OrchestratorError> {
        Self::new(OpenAiClientConfig::from_env(model)?)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new(&self.config.provider_id)
    }

    async fn start_stream(
        &self,
        req: ProviderRequest,
    ) -> Result<ProviderStreamHandle, ProviderError> {
        let provider_id = self.id();
        let body = build_request_body(&req, &self.config);
        debug!(request_id = %req.request_id, provider = %provider_id, model = %self.config.model, "starting responses stream");

        let response = self
            .client
            .post(self.config.responses_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::transport(provider_id.clone(), format!("request failed: {e}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ProviderError::provider(
                provider_id,
                format!("responses request failed with status {status}: {detail}"),
                Some(status.as_u16()),
            ));
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(ProviderStreamHandle::new(event_stream(
            provider_id,
            bytes_stream,
        )))
    }
}

pub(crate) fn build_request_body(
    req: &ProviderRequest,
    config: &OpenAiClientConfig,
) -> serde_json::Value {
    let mut input = Vec::new();
    if let Some(system_prompt) = req
        .system_prompt
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        input.push(serde_json::json!({ "role": "system", "content": system_prompt }));
    }
    for turn in &req.prior_turns {
        let role = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        input.push(serde_json::json!({ "role": role, "content": turn.text }));
    }
    input.push(serde_json::json!({ "role": "user", "content": req.prompt }));

    let mut body = serde_json::json!({
        "model": config.model,
        "input": input,
        "stream": true,
        "store": false,
    });
    if config.request_reasoning {
        body["reasoning"] = serde_json::json!({ "summary": "auto" });
    }
    body
}

/// Turns the raw byte stream into provider events.
///
/// Each network chunk may decode into several frames and each frame into
/// several events, so decoded events queue up and are replayed one per poll.
fn event_stream(
    provider_id: ProviderId,
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<ProviderEvent, ProviderError>> + Send {
    struct State {
        provider_id: ProviderId,
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        ready: VecDeque<ProviderEvent>,
        exhausted: bool,
    }

    stream::try_unfold(
        State {
            provider_id,
            bytes_stream,
            decoder: SseDecoder::default(),
            ready: VecDeque::new(),
            exhausted: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.ready.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }
                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(&chunk) {
                            state
                                .ready
                                .extend(decode_frame(&state.provider_id, &frame)?);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::transport(
                            state.provider_id,
                            format!("streaming read failed: {e}"),
                        ));
                    }
                    None => state.exhausted = true,
                }
            }
        },
    )
}
