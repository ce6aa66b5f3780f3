//
// Copyright 2026 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Chat completion requests and the events decoded from their responses.
//!
//! A request is one JSON document sealed into a single frame. The response is
//! a sequence of frames, each holding one JSON chunk tagged by `type`.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    channel::{ResponseFrames, SecureChannel},
    config::MalformedFramePolicy,
    ChannelError,
};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_owned(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_owned(), content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.into(), messages, stream: true, temperature: None, max_tokens: None }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    Reasoning(String),
    ToolCall { name: String, args: Value },
    Finish { reason: Option<String>, prompt_tokens: Option<u64>, completion_tokens: Option<u64> },
    Error(String),
}

#[derive(Deserialize)]
struct TextChunk {
    text: String,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(rename = "toolName", alias = "name")]
    tool_name: String,
    #[serde(default, alias = "arguments")]
    args: Value,
}

#[derive(Default, Deserialize)]
struct Usage {
    #[serde(default, rename = "promptTokens", alias = "prompt_tokens")]
    prompt_tokens: Option<u64>,
    #[serde(default, rename = "completionTokens", alias = "completion_tokens")]
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct FinishChunk {
    #[serde(default, rename = "finish_reason", alias = "finishReason")]
    finish_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ErrorChunk {
    #[serde(default)]
    message: Option<String>,
}

/// Decodes one response chunk. `Ok(None)` means the chunk carries nothing to
/// show and can be ignored.
pub fn parse_event(payload: &[u8]) -> Result<Option<StreamEvent>, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    let event = match value.get("type").and_then(Value::as_str) {
        Some("text-delta") => {
            StreamEvent::TextDelta(serde_json::from_value::<TextChunk>(value)?.text)
        }
        Some("reasoning") => {
            StreamEvent::Reasoning(serde_json::from_value::<TextChunk>(value)?.text)
        }
        Some("tool-call") => {
            let chunk: ToolCallChunk = serde_json::from_value(value)?;
            StreamEvent::ToolCall { name: chunk.tool_name, args: chunk.args }
        }
        Some("finish") => {
            let chunk: FinishChunk = serde_json::from_value(value)?;
            let usage = chunk.usage.unwrap_or_default();
            StreamEvent::Finish {
                reason: chunk.finish_reason,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }
        }
        Some("error") => {
            let chunk: ErrorChunk = serde_json::from_value(value)?;
            StreamEvent::Error(chunk.message.unwrap_or_else(|| "unknown error".to_owned()))
        }
        _ => match value.get("content").and_then(Value::as_str) {
            Some(content) => StreamEvent::TextDelta(content.to_owned()),
            None => {
                debug!("ignoring chunk without a known type");
                return Ok(None);
            }
        },
    };
    Ok(Some(event))
}

fn is_finish(payload: &[u8]) -> bool {
    matches!(parse_event(payload), Ok(Some(StreamEvent::Finish { .. })))
}

struct EventState {
    frames: ResponseFrames,
    policy: MalformedFramePolicy,
    done: bool,
}

impl EventState {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        loop {
            let payload = match self.frames.next().await? {
                Ok(payload) => payload,
                Err(err) => {
                    self.done = true;
                    return Some(StreamEvent::Error(err.to_string()));
                }
            };
            match parse_event(&payload) {
                Ok(Some(event)) => {
                    self.done = matches!(event, StreamEvent::Finish { .. });
                    return Some(event);
                }
                Ok(None) => {}
                Err(err) => match self.policy {
                    MalformedFramePolicy::Skip => warn!("skipping malformed frame: {err}"),
                    MalformedFramePolicy::Abort => {
                        self.done = true;
                        return Some(StreamEvent::Error(format!("malformed frame: {err}")));
                    }
                },
            }
        }
    }
}

/// Sends `request` over `channel` and returns the decoded response events.
///
/// The stream ends after a `Finish` event, at the end-of-stream marker, or
/// after a single terminal `Error` if the channel fails. Dropping it early
/// leaves the channel usable.
pub async fn stream_chat(
    channel: &Arc<SecureChannel>,
    request: &ChatRequest,
    policy: MalformedFramePolicy,
) -> Result<BoxStream<'static, StreamEvent>, ChannelError> {
    let payload = serde_json::to_vec(request)
        .map_err(|err| ChannelError::InvalidRequest(err.to_string()))?;
    let frames = channel.send_and_stream_until(&payload, is_finish).await?;
    let state = EventState { frames, policy, done: false };
    Ok(stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((event, state))
    })
    .boxed())
}
