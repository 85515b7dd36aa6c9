//! OpenAI request → upstream `conversationState` payload.
//!
//! The transformation is a fixed pipeline: extract the system prompt, rewrite
//! oversized tool descriptions into the system prompt, fold messages into
//! upstream turns, merge adjacent same-role turns, then lift the last turn
//! out as the current message.

use tracing::debug;

use kiro_core::ids;

use crate::model_map;
use crate::openai::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, ToolEntry};
use crate::payload::{
    AssistantResponseMessage, ConversationState, GenerateRequest, InputSchema, ToolEnvelope,
    ToolResult, ToolResultContent, ToolSpecification, ToolUse, Turn, UserInputMessage,
    CHAT_TRIGGER_MANUAL, TOOL_RESULT_SUCCESS,
};

pub struct TransformOptions {
    pub profile_arn: Option<String>,
    /// Tool descriptions longer than this move into the system prompt.
    pub tool_description_max_length: usize,
}

/// Flatten union-typed message content to plain text. Non-text parts (images
/// and friends) contribute nothing.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Split tools into wire-ready specifications, relocating any description
/// longer than `max_len` behind a reference sentinel. Returns the rewritten
/// specs and the displaced `(name, description)` pairs in input order.
pub fn process_tools_with_long_descriptions(
    tools: &[ToolEntry],
    max_len: usize,
) -> (Vec<ToolEnvelope>, Vec<(String, String)>) {
    let mut specs = Vec::with_capacity(tools.len());
    let mut extra_docs = Vec::new();

    for tool in tools {
        let name = tool.function.name.clone();
        let description = if tool.function.description.chars().count() <= max_len {
            tool.function.description.clone()
        } else {
            debug!(
                tool = %name,
                len = tool.function.description.len(),
                "relocating oversized tool description into system prompt"
            );
            extra_docs.push((name.clone(), tool.function.description.clone()));
            format!("[Full documentation in system prompt under '## Tool: {name}']")
        };
        specs.push(ToolEnvelope {
            tool_specification: ToolSpecification {
                name,
                description,
                input_schema: InputSchema {
                    json: tool.function.parameters.clone(),
                },
            },
        });
    }

    (specs, extra_docs)
}

fn render_extra_docs(extra_docs: &[(String, String)]) -> String {
    extra_docs
        .iter()
        .map(|(name, desc)| format!("## Tool: {name}\n{desc}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn compose_system_prompt(system_prompt: &str, extra_docs: &[(String, String)]) -> String {
    let mut parts = Vec::new();
    if !system_prompt.is_empty() {
        parts.push(system_prompt.to_string());
    }
    if !extra_docs.is_empty() {
        parts.push(render_extra_docs(extra_docs));
    }
    parts.join("\n\n")
}

fn join_text(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else if b.is_empty() {
        a.to_string()
    } else {
        format!("{a}\n{b}")
    }
}

/// Collapse adjacent same-role turns into one, concatenating text and
/// unioning tool-use / tool-result blocks in order. Idempotent.
pub fn merge_adjacent_messages(turns: Vec<Turn>) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());

    for mut turn in turns {
        if let Some(prev) = merged.last_mut() {
            if try_merge(prev, &mut turn) {
                continue;
            }
        }
        merged.push(turn);
    }

    merged
}

/// Fold `next` into `prev` when both carry the same role; `next` is drained
/// on success.
fn try_merge(prev: &mut Turn, next: &mut Turn) -> bool {
    match (prev, next) {
        (Turn::UserInputMessage(prev), Turn::UserInputMessage(next)) => {
            prev.content = join_text(&prev.content, &next.content);
            if let Some(ctx) = next.user_input_message_context.take() {
                let merged_ctx = prev.context_mut();
                merged_ctx.tools.extend(ctx.tools);
                merged_ctx.tool_results.extend(ctx.tool_results);
            }
            true
        }
        (Turn::AssistantResponseMessage(prev), Turn::AssistantResponseMessage(next)) => {
            prev.content = join_text(&prev.content, &next.content);
            prev.tool_uses.extend(std::mem::take(&mut next.tool_uses));
            true
        }
        _ => false,
    }
}

fn tool_uses_from(calls: &[crate::openai::RequestToolCall]) -> Vec<ToolUse> {
    calls
        .iter()
        .map(|call| {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({ "raw": call.function.arguments }));
            ToolUse {
                tool_use_id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            }
        })
        .collect()
}

fn message_to_turn(msg: &ChatMessage) -> Turn {
    let text = msg.content.as_ref().map(extract_text).unwrap_or_default();
    match msg.role.as_str() {
        "assistant" => Turn::AssistantResponseMessage(AssistantResponseMessage {
            content: text,
            tool_uses: msg
                .tool_calls
                .as_deref()
                .map(tool_uses_from)
                .unwrap_or_default(),
        }),
        "tool" => {
            let mut user = UserInputMessage::text(String::new());
            user.context_mut().tool_results.push(ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: vec![ToolResultContent { text }],
                status: TOOL_RESULT_SUCCESS,
            });
            Turn::UserInputMessage(user)
        }
        // user, plus any stray non-leading system message: carried as user
        // text so nothing is dropped.
        _ => Turn::UserInputMessage(UserInputMessage::text(text)),
    }
}

/// Build the upstream payload for one chat-completions request.
pub fn build_upstream_payload(
    req: &ChatCompletionRequest,
    opts: &TransformOptions,
) -> GenerateRequest {
    let model_id = model_map::internal_id(&req.model).to_string();

    // Leading system messages form the system prompt.
    let leading_system = req
        .messages
        .iter()
        .take_while(|m| m.role == "system")
        .count();
    let system_prompt = req.messages[..leading_system]
        .iter()
        .map(|m| m.content.as_ref().map(extract_text).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    let working = &req.messages[leading_system..];

    let (tool_specs, extra_docs) =
        process_tools_with_long_descriptions(&req.tools, opts.tool_description_max_length);
    let effective_system = compose_system_prompt(&system_prompt, &extra_docs);

    let mut turns: Vec<Turn> = working.iter().map(message_to_turn).collect();

    // Prepend the effective system prompt to the first user turn; with no
    // user turn at all, the prompt becomes its own (current) user message.
    if !effective_system.is_empty() {
        match turns.iter().position(|t| t.is_user()) {
            Some(i) => {
                if let Turn::UserInputMessage(user) = &mut turns[i] {
                    user.content = if user.content.is_empty() {
                        effective_system
                    } else {
                        format!("{effective_system}\n\n{}", user.content)
                    };
                }
            }
            None => turns.push(Turn::UserInputMessage(UserInputMessage::text(
                effective_system,
            ))),
        }
    }

    let mut turns = merge_adjacent_messages(turns);

    // Lift the last turn as the current message. The upstream requires a
    // user-side current message, so an assistant tail stays in history.
    let mut current = match turns.pop() {
        Some(Turn::UserInputMessage(user)) => user,
        Some(assistant @ Turn::AssistantResponseMessage(_)) => {
            turns.push(assistant);
            UserInputMessage::text(String::new())
        }
        None => UserInputMessage::text(String::new()),
    };

    current.model_id = Some(model_id);
    if !tool_specs.is_empty() {
        current.context_mut().tools = tool_specs;
    }

    GenerateRequest {
        profile_arn: opts.profile_arn.clone(),
        conversation_state: ConversationState {
            chat_trigger_type: CHAT_TRIGGER_MANUAL,
            conversation_id: ids::conversation_id(),
            current_message: Turn::UserInputMessage(current),
            history: turns,
        },
    }
}
