use super::models::*;
use crate::proxy::signature_cache::{ModelFamily, SignatureCache};

pub fn map_finish_reason(finish_reason: Option<&str>, used_tool: bool) -> &'static str {
    if used_tool {
        return "tool_use";
    }
    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

// The cached prompt prefix is reported inside promptTokenCount; Anthropic
// accounting wants it split out. input + cache_read always equals the
// upstream prompt count.
pub fn to_claude_usage(meta: &UsageMetadata) -> Usage {
    let prompt = meta.prompt_token_count.unwrap_or(0);
    let cached = meta.cached_content_token_count.unwrap_or(0).min(prompt);
    Usage {
        input_tokens: prompt - cached,
        output_tokens: meta.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: if cached > 0 { Some(cached) } else { None },
    }
}

// Accumulates the candidate's parts, in order, into Anthropic content
// blocks. Signatures ride along on thinking and tool_use blocks and get
// cached for later restoration.
pub fn to_claude_response(
    response: &GeminiResponse,
    model: &str,
    cache: &SignatureCache,
) -> ClaudeResponse {
    let family = ModelFamily::of_model(model);
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut used_tool = false;
    let mut finish_reason: Option<String> = None;

    if let Some(candidate) = response.candidates.first() {
        finish_reason = candidate.finish_reason.clone();
        if let Some(body) = &candidate.content {
            for part in &body.parts {
                append_part(part, family, cache, &mut content, &mut used_tool);
            }
        }
    }

    let usage = response
        .usage_metadata
        .as_ref()
        .map(to_claude_usage)
        .unwrap_or_default();

    ClaudeResponse {
        id: response
            .response_id
            .clone()
            .unwrap_or_else(|| "msg_unknown".to_string()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response
            .model_version
            .clone()
            .unwrap_or_else(|| model.to_string()),
        content,
        stop_reason: map_finish_reason(finish_reason.as_deref(), used_tool).to_string(),
        stop_sequence: None,
        usage,
    }
}

fn append_part(
    part: &GeminiPart,
    family: ModelFamily,
    cache: &SignatureCache,
    content: &mut Vec<ContentBlock>,
    used_tool: &mut bool,
) {
    if let Some(call) = &part.function_call {
        *used_tool = true;
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", call.name, uuid::Uuid::new_v4().simple()));
        if let Some(sig) = &part.thought_signature {
            cache.record_tool_signature(&id, sig, family);
        }
        content.push(ContentBlock::ToolUse {
            id,
            name: call.name.clone(),
            input: call.args.clone().unwrap_or(serde_json::json!({})),
            signature: part.thought_signature.clone(),
        });
        return;
    }
    if let Some(text) = &part.text {
        if part.thought.unwrap_or(false) {
            if let Some(sig) = &part.thought_signature {
                cache.record_thinking_signature(text, sig, family);
            }
            // Consecutive thought parts merge into one block.
            if let Some(ContentBlock::Thinking {
                thinking,
                signature,
            }) = content.last_mut()
            {
                thinking.push_str(text);
                if signature.is_none() {
                    *signature = part.thought_signature.clone();
                }
            } else {
                content.push(ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: part.thought_signature.clone(),
                });
            }
        } else if !text.is_empty() {
            if let Some(ContentBlock::Text { text: existing }) = content.last_mut() {
                existing.push_str(text);
            } else {
                content.push(ContentBlock::Text { text: text.clone() });
            }
        }
    }
}
