use super::models::*;
use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

// Thinking models only stream upstream, so non-streaming callers are served
// by draining the translated Anthropic event stream back into one message.
pub async fn collect_stream_to_message<S>(stream: S) -> ProxyResult<ClaudeResponse>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    futures::pin_mut!(stream);

    let mut response = ClaudeResponse {
        id: "msg_unknown".to_string(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: String::new(),
        content: Vec::new(),
        stop_reason: "end_turn".to_string(),
        stop_sequence: None,
        usage: Usage::default(),
    };

    let mut event_type = String::new();
    let mut data_line = String::new();
    let mut pending = String::new();

    let mut current_text = String::new();
    let mut current_thinking = String::new();
    let mut current_signature: Option<String> = None;
    let mut current_tool: Option<Value> = None;
    let mut current_tool_args = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::Transient(format!("stream read: {}", e)))?;
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = pending.find('\n') {
            let line = pending[..pos].trim_end_matches('\r').to_string();
            pending.drain(..=pos);

            if line.is_empty() {
                if !data_line.is_empty() {
                    if let Ok(data) = serde_json::from_str::<Value>(&data_line) {
                        apply_event(
                            &event_type,
                            &data,
                            &mut response,
                            &mut current_text,
                            &mut current_thinking,
                            &mut current_signature,
                            &mut current_tool,
                            &mut current_tool_args,
                        )?;
                    }
                }
                event_type.clear();
                data_line.clear();
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                event_type = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_line = value.trim().to_string();
            }
        }
    }

    Ok(response)
}

#[allow(clippy::too_many_arguments)]
fn apply_event(
    event_type: &str,
    data: &Value,
    response: &mut ClaudeResponse,
    current_text: &mut String,
    current_thinking: &mut String,
    current_signature: &mut Option<String>,
    current_tool: &mut Option<Value>,
    current_tool_args: &mut String,
) -> ProxyResult<()> {
    match event_type {
        "message_start" => {
            if let Some(message) = data.get("message") {
                if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                    response.id = id.to_string();
                }
                if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                    response.model = model.to_string();
                }
                if let Some(usage) = message.get("usage") {
                    if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                        response.usage = parsed;
                    }
                }
            }
        }
        "content_block_start" => {
            if let Some(block) = data.get("content_block") {
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => current_text.clear(),
                    Some("thinking") => {
                        current_thinking.clear();
                        *current_signature = block
                            .get("signature")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                    }
                    Some("tool_use") => {
                        *current_tool = Some(block.clone());
                        current_tool_args.clear();
                    }
                    _ => {}
                }
            }
        }
        "content_block_delta" => {
            if let Some(delta) = data.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            current_text.push_str(text);
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) = delta.get("thinking").and_then(|v| v.as_str()) {
                            current_thinking.push_str(thinking);
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(sig) = delta.get("signature").and_then(|v| v.as_str()) {
                            *current_signature = Some(sig.to_string());
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            current_tool_args.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            if let Some(tool) = current_tool.take() {
                let input = if current_tool_args.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(current_tool_args).unwrap_or(json!({}))
                };
                response.content.push(ContentBlock::ToolUse {
                    id: tool
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("toolu_unknown")
                        .to_string(),
                    name: tool
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("tool")
                        .to_string(),
                    input,
                    signature: None,
                });
                current_tool_args.clear();
            } else if !current_thinking.is_empty() {
                response.content.push(ContentBlock::Thinking {
                    thinking: std::mem::take(current_thinking),
                    signature: current_signature.take(),
                });
            } else if !current_text.is_empty() {
                response.content.push(ContentBlock::Text {
                    text: std::mem::take(current_text),
                });
            }
        }
        "message_delta" => {
            if let Some(stop) = data.pointer("/delta/stop_reason").and_then(|v| v.as_str()) {
                response.stop_reason = stop.to_string();
            }
            if let Some(usage) = data.get("usage") {
                if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                    // message_start carried the input side; keep it if the
                    // final frame reports zeros there.
                    let input = if parsed.input_tokens == 0 {
                        response.usage.input_tokens
                    } else {
                        parsed.input_tokens
                    };
                    let cache_read = parsed
                        .cache_read_input_tokens
                        .or(response.usage.cache_read_input_tokens);
                    response.usage = Usage {
                        input_tokens: input,
                        output_tokens: parsed.output_tokens,
                        cache_read_input_tokens: cache_read,
                    };
                }
            }
        }
        "error" => {
            let message = data
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("stream error");
            return Err(ProxyError::Transient(message.to_string()));
        }
        _ => {}
    }
    Ok(())
}
