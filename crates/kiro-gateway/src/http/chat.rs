//! POST /v1/chat/completions — the protocol adapter endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use kiro_adapter::collect::collect_stream;
use kiro_adapter::driver::request_with_retry;
use kiro_adapter::openai::{ChatCompletionChunk, ChatCompletionRequest};
use kiro_adapter::parser::EventStreamParser;
use kiro_adapter::transcode::{pump_upstream_stream, Transcoder};
use kiro_adapter::transform::{build_upstream_payload, TransformOptions};
use kiro_core::error::GatewayError;

use crate::app::AppState;
use crate::auth::require_proxy_key;
use crate::http::error_response;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = require_proxy_key(state.config.proxy_api_key.as_deref(), &headers) {
        return error_response(&e).into_response();
    }

    // Decoded from raw bytes so schema violations surface as 422 rather
    // than axum's default 400.
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(&GatewayError::Validation(e.to_string())).into_response()
        }
    };
    if req.messages.is_empty() {
        return error_response(&GatewayError::Validation(
            "messages must not be empty".into(),
        ))
        .into_response();
    }

    info!(
        model = %req.model,
        stream = req.stream,
        messages = req.messages.len(),
        tools = req.tools.len(),
        "chat completion request"
    );

    state.debug.prepare_new_request();
    if let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&body) {
        state.debug.log_request_body(&raw);
    }

    let payload = build_upstream_payload(
        &req,
        &TransformOptions {
            profile_arn: state.tokens.profile_arn().map(String::from),
            tool_description_max_length: state.config.tool_description_max_length,
        },
    );
    let payload_bytes = match serde_json::to_vec(&payload) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&GatewayError::Serialization(e)).into_response(),
    };
    if let Ok(value) = serde_json::to_value(&payload) {
        state.debug.log_kiro_request_body(&value);
    }

    let url = format!("{}/generateAssistantResponse", state.tokens.api_host());
    let upstream = match request_with_retry(&state.retry, &state.tokens, |token| {
        let mut r = state
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .body(payload_bytes.clone());
        for (name, value) in state.tokens.upstream_headers() {
            r = r.header(name, value);
        }
        r.send()
    })
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            return error_response(&e).into_response();
        }
    };

    let max_input = state.models.get_max_input_tokens(&req.model);
    let parser = EventStreamParser::new();
    let transcoder = Transcoder::new(req.model.clone(), max_input);
    let (tx, rx) = mpsc::channel::<ChatCompletionChunk>(64);
    tokio::spawn(pump_upstream_stream(
        upstream,
        parser,
        transcoder,
        state.debug.clone(),
        tx,
    ));

    if req.stream {
        streaming_response(rx).into_response()
    } else {
        Json(collect_stream(rx).await).into_response()
    }
}

/// Render the chunk channel as SSE, flushing each chunk eagerly and closing
/// with the terminal `[DONE]` frame. Dropping the client drops `rx`, which
/// unwinds the pump task.
fn streaming_response(
    mut rx: mpsc::Receiver<ChatCompletionChunk>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            let json = match serde_json::to_string(&chunk) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable chunk");
                    continue;
                }
            };
            yield Ok(Event::default().data(json));
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
