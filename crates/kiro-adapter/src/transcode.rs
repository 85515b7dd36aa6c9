//! Upstream events → OpenAI chat-completion chunks.
//!
//! [`Transcoder`] is a pure state machine so the emission rules are testable
//! without IO; [`pump_upstream_stream`] drives it over a live upstream
//! response body into a channel of chunks.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use kiro_core::ids;

use crate::debug::DebugSink;
use crate::openai::{
    ChatCompletionChunk, ChunkChoice, Delta, FunctionDelta, ToolCallDelta, Usage,
};
use crate::parser::{EventStreamParser, StreamEvent};

pub struct Transcoder {
    completion_id: String,
    created: i64,
    model: String,
    max_input_tokens: u32,
    emitted_role: bool,
    next_tool_index: u32,
    tool_index_by_id: HashMap<String, u32>,
    chars_emitted: usize,
    any_tool_calls: bool,
    finished: bool,
    context_usage_percent: Option<f64>,
    credits_used: Option<f64>,
}

impl Transcoder {
    /// `model` is echoed back to the client exactly as requested.
    pub fn new(model: String, max_input_tokens: u32) -> Self {
        Self {
            completion_id: ids::completion_id(),
            created: chrono::Utc::now().timestamp(),
            model,
            max_input_tokens,
            emitted_role: false,
            next_tool_index: 0,
            tool_index_by_id: HashMap::new(),
            chars_emitted: 0,
            any_tool_calls: false,
            finished: false,
            context_usage_percent: None,
            credits_used: None,
        }
    }

    pub fn completion_id(&self) -> &str {
        &self.completion_id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.completion_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// The opening chunk carrying the assistant role, sent exactly once.
    pub fn open(&mut self) -> ChatCompletionChunk {
        self.emitted_role = true;
        self.chunk(
            Delta {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
            None,
        )
    }

    /// Render one parser event into zero or more chunks.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        match event {
            StreamEvent::Content { text } => {
                self.chars_emitted += text.chars().count();
                vec![self.chunk(
                    Delta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )]
            }
            StreamEvent::ToolStart { id, name } => {
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                self.any_tool_calls = true;
                let call_id = if id.is_empty() {
                    ids::tool_call_id()
                } else {
                    id.clone()
                };
                self.tool_index_by_id.insert(id, index);
                vec![self.chunk(
                    Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(call_id),
                            kind: Some("function".to_string()),
                            function: FunctionDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            },
                        }]),
                        ..Default::default()
                    },
                    None,
                )]
            }
            StreamEvent::ToolInput { id, text } => {
                let Some(&index) = self.tool_index_by_id.get(&id) else {
                    warn!(tool_use_id = %id, "input fragment for unknown tool call");
                    return Vec::new();
                };
                vec![self.chunk(
                    Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: None,
                            kind: None,
                            function: FunctionDelta {
                                name: None,
                                arguments: Some(text),
                            },
                        }]),
                        ..Default::default()
                    },
                    None,
                )]
            }
            // Stop is implicit: arguments are complete once no more input
            // fragments arrive for the index.
            StreamEvent::ToolStop { .. } => Vec::new(),
            StreamEvent::ContextUsage { percent } => {
                self.context_usage_percent = Some(percent);
                Vec::new()
            }
            StreamEvent::Usage { credits } => {
                self.credits_used = Some(credits);
                Vec::new()
            }
            StreamEvent::End => {
                self.finished = true;
                let reason = if self.any_tool_calls {
                    "tool_calls"
                } else {
                    "stop"
                };
                let mut out = vec![self.chunk(Delta::default(), Some(reason.to_string()))];
                if let Some(usage) = self.synthesize_usage() {
                    out.push(ChatCompletionChunk {
                        id: self.completion_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created: self.created,
                        model: self.model.clone(),
                        choices: Vec::new(),
                        usage: Some(usage),
                    });
                }
                out
            }
        }
    }

    /// Token counts are synthetic: the upstream reports context percentage
    /// and credits, never token totals.
    fn synthesize_usage(&self) -> Option<Usage> {
        if self.context_usage_percent.is_none() && self.credits_used.is_none() {
            return None;
        }
        let prompt_tokens = self
            .context_usage_percent
            .map(|pct| (pct * f64::from(self.max_input_tokens) / 100.0).round() as u32)
            .unwrap_or(0);
        let completion_tokens = (self.chars_emitted / 4) as u32;
        Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            credits_used: self.credits_used,
        })
    }
}

/// Drive the upstream body through parser and transcoder into `tx`.
///
/// A transport error mid-stream truncates the response: the parser is
/// finalized so the client still receives a finish chunk and terminal
/// `[DONE]`. A dropped receiver (client disconnect) aborts quietly.
pub async fn pump_upstream_stream(
    resp: reqwest::Response,
    mut parser: EventStreamParser,
    mut transcoder: Transcoder,
    sink: Arc<DebugSink>,
    tx: mpsc::Sender<ChatCompletionChunk>,
) {
    if send_chunk(&tx, transcoder.open(), &sink).await.is_err() {
        return;
    }

    let mut body = resp.bytes_stream();
    while let Some(next) = body.next().await {
        match next {
            Ok(bytes) => {
                sink.log_raw_chunk(&bytes);
                for event in parser.push(&bytes) {
                    for chunk in transcoder.handle(event) {
                        if send_chunk(&tx, chunk, &sink).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "upstream stream error, truncating response");
                break;
            }
        }
    }

    for event in parser.finish() {
        for chunk in transcoder.handle(event) {
            if send_chunk(&tx, chunk, &sink).await.is_err() {
                return;
            }
        }
    }
    debug!(id = %transcoder.completion_id(), "upstream stream complete");
}

async fn send_chunk(
    tx: &mpsc::Sender<ChatCompletionChunk>,
    chunk: ChatCompletionChunk,
    sink: &DebugSink,
) -> Result<(), ()> {
    if let Ok(line) = serde_json::to_string(&chunk) {
        sink.log_modified_chunk(&line);
    }
    tx.send(chunk).await.map_err(|_| ())
}
