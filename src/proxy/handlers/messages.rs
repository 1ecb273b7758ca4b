use crate::error::ProxyError;
use crate::proxy::mappers::claude::models::{ClaudeRequest, GeminiResponse};
use crate::proxy::mappers::claude::{
    build_generate_request, collect_stream_to_message, prepare_messages, to_claude_response,
    translate_sse_stream, StreamContext, TranslationContext,
};
use crate::proxy::session::session_fingerprint;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::state::AppState;
use crate::proxy::upstream::UpstreamRequest;
use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, info};

fn new_trace_id() -> String {
    rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id = new_trace_id();

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::BadRequest(format!("invalid request body: {}", e)).into_response();
        }
    };
    if request.model.trim().is_empty() {
        return ProxyError::BadRequest("model is required".into()).into_response();
    }

    info!(
        "[{}] request | model: {} | stream: {} | messages: {} | tools: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
    );

    let ctx = TranslationContext::for_request(&request);
    let fingerprint = session_fingerprint(&request);

    let mut prepared = request.clone();
    prepare_messages(&mut prepared.messages, &ctx, SignatureCache::global());

    let google_request = match build_generate_request(&prepared, &ctx) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    // Thinking models only stream upstream; non-streaming callers get the
    // stream drained back into one message.
    let client_wants_stream = request.stream;
    let streaming = client_wants_stream || ctx.thinking_enabled;

    let upstream_request = UpstreamRequest {
        model: request.model.clone(),
        request: google_request,
        streaming,
        fingerprint,
        trace_id: trace_id.clone(),
    };

    let success = match state.upstream.generate(&upstream_request).await {
        Ok(success) => success,
        Err(e) => {
            debug!("[{}] request failed: {}", trace_id, e);
            return e.into_response();
        }
    };
    let email = success.email.clone();

    if streaming {
        let stream_ctx = StreamContext {
            trace_id: trace_id.clone(),
            email: email.clone(),
            model: request.model.clone(),
        };
        let translated = translate_sse_stream(success.response.bytes_stream(), stream_ctx);

        if client_wants_stream {
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .header("X-Accel-Buffering", "no")
                .header("X-Account-Email", &email)
                .body(Body::from_stream(translated))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        return match collect_stream_to_message(translated).await {
            Ok(message) => {
                info!(
                    "[{}] done | account: {} | in: {} out: {}",
                    trace_id, email, message.usage.input_tokens, message.usage.output_tokens,
                );
                ([("X-Account-Email", email.as_str())], axum::Json(message)).into_response()
            }
            Err(e) => e.into_response(),
        };
    }

    let bytes = match success.response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ProxyError::Transient(format!("failed to read upstream body: {}", e))
                .into_response();
        }
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            return ProxyError::Transient(format!("unparsable upstream body: {}", e))
                .into_response();
        }
    };
    let raw = value.get("response").unwrap_or(&value);
    let gemini: GeminiResponse = match serde_json::from_value(raw.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            return ProxyError::Transient(format!("unexpected upstream shape: {}", e))
                .into_response();
        }
    };
    let message = to_claude_response(&gemini, &request.model, SignatureCache::global());
    info!(
        "[{}] done | account: {} | in: {} out: {}",
        trace_id, email, message.usage.input_tokens, message.usage.output_tokens,
    );
    ([("X-Account-Email", email.as_str())], axum::Json(message)).into_response()
}
