//! Reduce a chunk stream into a single `chat.completion` object.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::openai::{
    ChatCompletion, ChatCompletionChunk, CompletionChoice, ResponseFunctionCall, ResponseMessage,
    ResponseToolCall,
};

/// Concatenate content deltas and reassemble tool calls by index. `id`,
/// `created`, and `finish_reason` pass through from the chunk stream.
pub fn collect_chunks(chunks: impl IntoIterator<Item = ChatCompletionChunk>) -> ChatCompletion {
    let mut id = String::new();
    let mut created = 0i64;
    let mut model = String::new();
    let mut content = String::new();
    let mut finish_reason = None;
    let mut usage = None;
    let mut tool_calls: BTreeMap<u32, ResponseToolCall> = BTreeMap::new();

    for chunk in chunks {
        if id.is_empty() {
            id = chunk.id;
            created = chunk.created;
            model = chunk.model;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                content.push_str(&text);
            }
            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let call = tool_calls.entry(delta.index).or_insert_with(|| {
                        ResponseToolCall {
                            id: String::new(),
                            kind: "function".to_string(),
                            function: ResponseFunctionCall {
                                name: String::new(),
                                arguments: String::new(),
                            },
                        }
                    });
                    if let Some(call_id) = delta.id {
                        call.id = call_id;
                    }
                    if let Some(name) = delta.function.name {
                        call.function.name = name;
                    }
                    if let Some(args) = delta.function.arguments {
                        call.function.arguments.push_str(&args);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                finish_reason = choice.finish_reason;
            }
        }
    }

    let tool_calls: Vec<ResponseToolCall> = tool_calls.into_values().collect();
    let message = ResponseMessage {
        role: "assistant".to_string(),
        content: if content.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(content)
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    };

    ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![CompletionChoice {
            index: 0,
            message,
            finish_reason,
        }],
        usage,
    }
}

/// Drain the transcoder channel and reduce it.
pub async fn collect_stream(mut rx: mpsc::Receiver<ChatCompletionChunk>) -> ChatCompletion {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    collect_chunks(chunks)
}
