use super::models::*;
use super::response::{map_finish_reason, to_claude_usage};
use crate::proxy::signature_cache::{ModelFamily, SignatureCache};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::{debug, warn};

pub struct StreamContext {
    pub trace_id: String,
    pub email: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    None,
    Thinking,
    Text,
    ToolUse,
}

// Drives the Anthropic event grammar:
//   message_start (content_block_start delta* content_block_stop)*
//   message_delta message_stop
pub struct StreamState {
    kind: BlockKind,
    index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    used_tool: bool,
    emitted_content: bool,
    pending_signature: Option<String>,
    family: ModelFamily,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            kind: BlockKind::None,
            index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            emitted_content: false,
            pending_signature: None,
            family: ModelFamily::of_model(model),
        }
    }

    fn emit(&self, event: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    fn message_start(&mut self, raw: &Value, fallback_model: &str) -> Option<Bytes> {
        if self.message_start_sent {
            return None;
        }
        self.message_start_sent = true;
        let usage = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
            .map(|u| to_claude_usage(&u))
            .unwrap_or_default();
        let message = json!({
            "id": raw.get("responseId").and_then(|v| v.as_str()).unwrap_or("msg_unknown"),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": raw.get("modelVersion").and_then(|v| v.as_str()).unwrap_or(fallback_model),
            "stop_reason": null,
            "stop_sequence": null,
            "usage": usage,
        });
        Some(self.emit("message_start", json!({ "type": "message_start", "message": message })))
    }

    fn start_block(&mut self, kind: BlockKind, content_block: Value) -> Vec<Bytes> {
        let mut chunks = self.end_block();
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.index,
                "content_block": content_block,
            }),
        ));
        self.kind = kind;
        chunks
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.kind == BlockKind::None {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        if self.kind == BlockKind::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                chunks.push(self.delta("signature_delta", json!({ "signature": signature })));
            }
        }
        chunks.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.index }),
        ));
        self.index += 1;
        self.kind = BlockKind::None;
        chunks
    }

    fn delta(&self, delta_type: &str, payload: Value) -> Bytes {
        let mut delta = json!({ "type": delta_type });
        if let Value::Object(map) = payload {
            for (k, v) in map {
                delta[k] = v;
            }
        }
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.index,
                "delta": delta,
            }),
        )
    }

    pub fn process_part(&mut self, part: &GeminiPart, cache: &SignatureCache) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        if let Some(call) = &part.function_call {
            self.used_tool = true;
            self.emitted_content = true;
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", call.name, uuid::Uuid::new_v4().simple()));
            if let Some(sig) = &part.thought_signature {
                cache.record_tool_signature(&id, sig, self.family);
            }
            chunks.extend(self.start_block(
                BlockKind::ToolUse,
                json!({ "type": "tool_use", "id": id, "name": call.name, "input": {} }),
            ));
            // The upstream delivers complete arguments, so one delta carries
            // the full serialized object.
            let args = call.args.clone().unwrap_or(json!({}));
            let serialized = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
            chunks.push(self.delta("input_json_delta", json!({ "partial_json": serialized })));
            chunks.extend(self.end_block());
            return chunks;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                if self.kind != BlockKind::Thinking {
                    chunks.extend(self.start_block(
                        BlockKind::Thinking,
                        json!({ "type": "thinking", "thinking": "" }),
                    ));
                }
                if !text.is_empty() {
                    chunks.push(self.delta("thinking_delta", json!({ "thinking": text })));
                }
                if let Some(sig) = &part.thought_signature {
                    cache.record_thinking_signature(text, sig, self.family);
                    self.pending_signature = Some(sig.clone());
                }
            } else if !text.is_empty() {
                self.emitted_content = true;
                if self.kind != BlockKind::Text {
                    chunks.extend(
                        self.start_block(BlockKind::Text, json!({ "type": "text", "text": "" })),
                    );
                }
                chunks.push(self.delta("text_delta", json!({ "text": text })));
            }
            return chunks;
        }

        if let Some(inline) = &part.inline_data {
            if !inline.data.is_empty() {
                self.emitted_content = true;
                let markdown = format!("![image](data:{};base64,{})", inline.mime_type, inline.data);
                if self.kind != BlockKind::Text {
                    chunks.extend(
                        self.start_block(BlockKind::Text, json!({ "type": "text", "text": "" })),
                    );
                }
                chunks.push(self.delta("text_delta", json!({ "text": markdown })));
            }
        }

        chunks
    }

    pub fn placeholder_if_empty(&mut self, marker: &str) -> Vec<Bytes> {
        if self.emitted_content || self.message_stop_sent {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        if !self.message_start_sent {
            if let Some(start) = self.message_start(&json!({}), "unknown") {
                chunks.push(start);
            }
        }
        chunks.extend(self.start_block(BlockKind::Text, json!({ "type": "text", "text": "" })));
        chunks.push(self.delta("text_delta", json!({ "text": marker })));
        chunks.extend(self.end_block());
        self.emitted_content = true;
        chunks
    }

    pub fn finish(
        &mut self,
        finish_reason: Option<&str>,
        usage: Option<&UsageMetadata>,
    ) -> Vec<Bytes> {
        if self.message_stop_sent {
            return Vec::new();
        }
        let mut chunks = self.end_block();
        let stop_reason = map_finish_reason(finish_reason, self.used_tool);
        let usage = usage.map(to_claude_usage).unwrap_or_default();
        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": usage,
            }),
        ));
        chunks.push(Bytes::from(
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ));
        self.message_stop_sent = true;
        chunks
    }

    pub fn error_event(&self, message: &str) -> Bytes {
        self.emit(
            "error",
            json!({
                "type": "error",
                "error": { "type": "api_error", "message": message },
            }),
        )
    }
}

// Parses one upstream SSE line. Only `data:` lines matter; everything else
// is protocol noise.
pub fn process_sse_line(
    line: &str,
    state: &mut StreamState,
    cache: &SignatureCache,
    ctx: &StreamContext,
) -> Vec<Bytes> {
    if state.message_stop_sent {
        return Vec::new();
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        debug!("[{}] skipping undecodable SSE data line", ctx.trace_id);
        return Vec::new();
    };
    let raw = value.get("response").unwrap_or(&value);

    let mut chunks = Vec::new();
    if let Some(start) = state.message_start(raw, &ctx.model) {
        chunks.push(start);
    }

    if let Some(parts) = raw
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
    {
        for part_value in parts {
            if let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) {
                chunks.extend(state.process_part(&part, cache));
            }
        }
    }

    if let Some(finish_reason) = raw
        .pointer("/candidates/0/finishReason")
        .and_then(|f| f.as_str())
    {
        let usage = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok());
        if let Some(meta) = &usage {
            debug!(
                "[{}] stream finished | account: {} | in: {} out: {}",
                ctx.trace_id,
                ctx.email,
                meta.prompt_token_count.unwrap_or(0),
                meta.candidates_token_count.unwrap_or(0),
            );
        }
        chunks.extend(state.finish(Some(finish_reason), usage.as_ref()));
    }
    chunks
}

const EMPTY_STREAM_MARKER: &str = "[viaduct] upstream returned an empty stream";

// Reads the upstream SSE byte stream line by line and re-emits it as the
// Anthropic event stream. On a mid-stream upstream failure the terminal
// `event: error` goes out and the stream ends; the grammar is still closed
// for well-behaved clients that saw message_start.
pub fn translate_sse_stream<S>(
    upstream: S,
    ctx: StreamContext,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    use futures::StreamExt;
    Box::pin(async_stream::stream! {
        futures::pin_mut!(upstream);
        let cache = SignatureCache::global();
        let mut state = StreamState::new(&ctx.model);
        let mut buffer = BytesMut::new();

        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_secs(30),
                upstream.next(),
            )
            .await;
            match next {
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        if let Ok(line) = std::str::from_utf8(&line_raw) {
                            for bytes in process_sse_line(line.trim(), &mut state, cache, &ctx) {
                                yield Ok(bytes);
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!("[{}] upstream stream error: {}", ctx.trace_id, e);
                    yield Ok(state.error_event(&format!("upstream stream error: {}", e)));
                    return;
                }
                Ok(None) => break,
                Err(_) => {
                    // Keepalive comment while the upstream is quiet.
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }

        for bytes in state.placeholder_if_empty(EMPTY_STREAM_MARKER) {
            yield Ok(bytes);
        }
        for bytes in state.finish(None, None) {
            yield Ok(bytes);
        }
    })
}
