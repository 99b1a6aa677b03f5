use crate::errors::ProviderError;
use crate::model::ProviderId;
use crate::provider::ProviderEvent;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental line-oriented SSE decoder.
///
/// Bytes arrive in arbitrary chunk boundaries; the decoder carries the
/// unterminated tail between calls and yields a frame per blank line.
#[derive(Default)]
pub(crate) struct SseDecoder {
    tail: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.tail.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();
        while let Some(newline) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim_start().to_string());
            }
            // Comment lines (":keepalive") and unknown fields are dropped.
        }
        frames
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        if event.is_none() && data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: data_lines.join("\n"),
        })
    }
}

/// Maps one SSE frame to zero or more provider events.
///
/// Visible output deltas and reasoning deltas become distinct event kinds;
/// completed non-message output items surface as structured items.
pub(crate) fn decode_frame(
    provider: &ProviderId,
    frame: &SseFrame,
) -> Result<Vec<ProviderEvent>, ProviderError> {
    let data = frame.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        ProviderError::transport(provider.clone(), format!("invalid SSE JSON frame: {e}"))
    })?;
    let Some(kind) = value.get("type").and_then(|v| v.as_str()) else {
        return Ok(Vec::new());
    };
    match kind {
        "response.output_text.delta" => Ok(delta_text(&value)
            .map(|text| ProviderEvent::TextDelta { text })
            .into_iter()
            .collect()),
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            Ok(delta_text(&value)
                .map(|text| ProviderEvent::ThinkingDelta { text })
                .into_iter()
                .collect())
        }
        "response.output_item.done" => {
            let Some(item) = value.get("item") else {
                return Ok(Vec::new());
            };
            // Message items are already streamed as text deltas; everything
            // else is a self-contained structured item.
            if item.get("type").and_then(|v| v.as_str()) == Some("message") {
                return Ok(Vec::new());
            }
            Ok(vec![ProviderEvent::Item {
                payload: item.clone(),
            }])
        }
        "response.completed" => {
            let finish_reason = value
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);
            Ok(vec![ProviderEvent::Completed { finish_reason }])
        }
        "response.failed" | "response.error" | "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .or_else(|| value.get("message").and_then(|v| v.as_str()))
                .unwrap_or("stream error");
            Err(ProviderError::provider(provider.clone(), message, None))
        }
        _ => Ok(Vec::new()),
    }
}

fn delta_text(value: &serde_json::Value) -> Option<String> {
    value
        .get("delta")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}
