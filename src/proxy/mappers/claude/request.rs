use super::models::*;
use super::thinking;
use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::mappers::json_schema;
use crate::proxy::signature_cache::{ModelFamily, SignatureCache};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

pub struct TranslationContext {
    pub model: String,
    pub family: ModelFamily,
    pub thinking_enabled: bool,
}

impl TranslationContext {
    pub fn for_request(request: &ClaudeRequest) -> Self {
        let thinking_enabled = request
            .thinking
            .as_ref()
            .map(|t| t.kind.as_deref() != Some("disabled"))
            .unwrap_or(false)
            || constants::is_thinking_model(&request.model);
        Self {
            model: request.model.clone(),
            family: ModelFamily::of_model(&request.model),
            thinking_enabled,
        }
    }
}

// Normalises the history before translation. Assistant turns get three
// passes: restore signatures the client stripped, drop trailing unsigned
// thinking (it cannot be sent back), and reorder blocks into the upstream's
// canonical [thinking, text, tool_use] order. Cross-family signatures are
// filtered before the tool-loop check so a broken loop is repaired in the
// same pass.
pub fn prepare_messages(
    messages: &mut Vec<Message>,
    ctx: &TranslationContext,
    cache: &SignatureCache,
) {
    thinking::restore_signatures(messages, cache);
    thinking::filter_incompatible_signatures(messages, ctx.family, cache);
    thinking::strip_trailing_unsigned_thinking(messages);
    thinking::reorder_blocks(messages);
    if ctx.thinking_enabled {
        thinking::close_tool_loop(messages);
    }
}

// Builds the inner Google-format request object. The upstream client wraps
// it in the {project, model, request, userAgent, requestId} envelope.
pub fn build_generate_request(
    request: &ClaudeRequest,
    ctx: &TranslationContext,
) -> ProxyResult<Value> {
    let mut body = serde_json::Map::new();

    let (contents, system_from_messages) = build_contents(&request.messages, ctx)?;
    body.insert("contents".to_string(), contents);

    if let Some(system) = build_system_instruction(request.system.as_ref(), system_from_messages) {
        body.insert("systemInstruction".to_string(), system);
    }

    body.insert(
        "generationConfig".to_string(),
        build_generation_config(request, ctx),
    );

    if let Some(tools) = build_tools(request.tools.as_ref())? {
        body.insert("tools".to_string(), tools);
    }

    Ok(Value::Object(body))
}

fn build_contents(messages: &[Message], ctx: &TranslationContext) -> ProxyResult<(Value, Vec<String>)> {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_texts: Vec<String> = Vec::new();
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for msg in messages {
        if msg.role == "system" {
            match &msg.content {
                MessageContent::Text(text) => system_texts.push(text.clone()),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if let ContentBlock::Text { text } = block {
                            system_texts.push(text.clone());
                        }
                    }
                }
            }
            continue;
        }
        let role = match msg.role.as_str() {
            "assistant" | "model" => "model",
            _ => "user",
        };
        let mut parts = match &msg.content {
            MessageContent::Text(text) => {
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![json!({ "text": text })]
                }
            }
            MessageContent::Blocks(blocks) => {
                blocks_to_parts(blocks, role == "model", ctx, &mut tool_names)?
            }
        };
        // The upstream rejects empty content outright.
        if parts.is_empty() {
            parts.push(json!({ "text": "." }));
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }

    Ok((Value::Array(contents), system_texts))
}

fn blocks_to_parts(
    blocks: &[ContentBlock],
    is_assistant: bool,
    ctx: &TranslationContext,
    tool_names: &mut HashMap<String, String>,
) -> ProxyResult<Vec<Value>> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
            }
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                if thinking.is_empty() {
                    continue;
                }
                match signature {
                    Some(sig) if ctx.thinking_enabled => {
                        parts.push(json!({
                            "text": thinking,
                            "thought": true,
                            "thoughtSignature": sig,
                        }));
                    }
                    // Unsigned or thinking-disabled: only the words survive.
                    _ => {
                        debug!("downgrading unsigned thinking block to text");
                        parts.push(json!({ "text": thinking }));
                    }
                }
            }
            ContentBlock::RedactedThinking { .. } => {
                parts.push(json!({ "text": "[redacted thinking]" }));
            }
            ContentBlock::Image { source } => {
                if source.source_type == "base64" {
                    parts.push(json!({
                        "inlineData": {
                            "mimeType": source.media_type,
                            "data": source.data,
                        }
                    }));
                }
            }
            ContentBlock::ToolUse {
                id,
                name,
                input,
                signature,
            } => {
                if is_assistant {
                    tool_names.insert(id.clone(), name.clone());
                }
                let mut part = json!({
                    "functionCall": {
                        "id": id,
                        "name": name,
                        "args": input,
                    }
                });
                if let Some(sig) = signature {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => match ctx.family {
                // Claude-family upstreams expect their own tool_result shape
                // handed back untouched.
                ModelFamily::Claude => {
                    parts.push(serde_json::to_value(block).map_err(|e| {
                        ProxyError::BadRequest(format!("unserializable tool result: {}", e))
                    })?);
                }
                ModelFamily::Gemini => {
                    let name = tool_names
                        .get(tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    parts.push(json!({
                        "functionResponse": {
                            "id": tool_use_id,
                            "name": name,
                            "response": { "result": flatten_tool_result(content, is_error.unwrap_or(false)) },
                        }
                    }));
                }
            },
        }
    }
    Ok(parts)
}

// Tool results arrive as plain strings or arrays of blocks; the upstream
// wants one string.
fn flatten_tool_result(content: &Value, is_error: bool) -> String {
    let merged = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    Some(text.to_string())
                } else if block.get("type").and_then(|v| v.as_str()) == Some("image") {
                    Some("[image omitted]".to_string())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if merged.trim().is_empty() {
        if is_error {
            "Tool execution failed with no output.".to_string()
        } else {
            "Tool executed successfully with no output.".to_string()
        }
    } else {
        merged
    }
}

fn build_system_instruction(system: Option<&Value>, extra: Vec<String>) -> Option<Value> {
    let mut texts: Vec<String> = Vec::new();
    match system {
        Some(Value::String(s)) if !s.trim().is_empty() => texts.push(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    texts.push(text.to_string());
                }
            }
        }
        _ => {}
    }
    texts.extend(extra);
    if texts.is_empty() {
        return None;
    }
    let parts: Vec<Value> = texts.into_iter().map(|t| json!({ "text": t })).collect();
    Some(json!({ "parts": parts }))
}

fn build_generation_config(request: &ClaudeRequest, ctx: &TranslationContext) -> Value {
    let mut config = serde_json::Map::new();
    let mut max_tokens = request.max_tokens;

    if ctx.thinking_enabled {
        let requested_budget = request.thinking.as_ref().and_then(|t| t.budget_tokens);
        match ctx.family {
            ModelFamily::Claude => {
                let mut thinking_config = json!({ "include_thoughts": true });
                if let Some(budget) = requested_budget {
                    thinking_config["thinking_budget"] = json!(budget);
                    // The output cap must leave room past the thinking budget
                    // or the answer gets truncated inside the thoughts.
                    if max_tokens.unwrap_or(0) <= budget {
                        max_tokens = Some(budget + constants::THINKING_MAX_TOKENS_MARGIN);
                    }
                }
                config.insert("thinkingConfig".to_string(), thinking_config);
            }
            ModelFamily::Gemini => {
                let budget = requested_budget.unwrap_or(constants::DEFAULT_THINKING_BUDGET);
                config.insert(
                    "thinkingConfig".to_string(),
                    json!({ "includeThoughts": true, "thinkingBudget": budget }),
                );
            }
        }
    }

    if ctx.family == ModelFamily::Gemini {
        max_tokens = max_tokens.map(|t| t.min(constants::GEMINI_MAX_OUTPUT_TOKENS));
    }
    if let Some(tokens) = max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = request.top_k {
        config.insert("topK".to_string(), json!(top_k));
    }
    if let Some(stops) = &request.stop_sequences {
        if !stops.is_empty() {
            config.insert("stopSequences".to_string(), json!(stops));
        }
    }
    Value::Object(config)
}

fn build_tools(tools: Option<&Vec<Tool>>) -> ProxyResult<Option<Value>> {
    let Some(tools) = tools else {
        return Ok(None);
    };
    let mut declarations = Vec::new();
    for tool in tools {
        let mut schema = tool
            .input_spec()
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
        json_schema::sanitize_schema(&mut schema);
        declarations.push(json!({
            "name": json_schema::sanitize_tool_name(&tool.name),
            "description": tool.description.clone().unwrap_or_default(),
            "parameters": schema,
        }));
    }
    if declarations.is_empty() {
        return Ok(None);
    }
    Ok(Some(json!([{ "functionDeclarations": declarations }])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini_ctx() -> TranslationContext {
        TranslationContext {
            model: "gemini-3-pro".into(),
            family: ModelFamily::Gemini,
            thinking_enabled: false,
        }
    }

    fn thinking_ctx(model: &str) -> TranslationContext {
        TranslationContext {
            model: model.into(),
            family: ModelFamily::of_model(model),
            thinking_enabled: true,
        }
    }

    fn text_message(role: &str, text: &str) -> Message {
        Message {
            role: role.into(),
            content: MessageContent::Text(text.into()),
        }
    }

    #[test]
    fn roles_map_and_system_lifts_to_instruction() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            system: Some(json!("be terse")),
            messages: vec![
                text_message("user", "hi"),
                text_message("assistant", "hello"),
            ],
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn empty_content_becomes_dot_part() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            messages: vec![text_message("user", "   ")],
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], ".");
    }

    #[test]
    fn tool_use_becomes_function_call_and_result_function_response() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            messages: vec![
                Message {
                    role: "assistant".into(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "read_file".into(),
                        input: json!({"path": "a.txt"}),
                        signature: None,
                    }]),
                },
                Message {
                    role: "user".into(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: json!([{"type": "text", "text": "file body"}]),
                        is_error: None,
                    }]),
                },
            ],
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        let call = &body["contents"][0]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "read_file");
        assert_eq!(call["args"]["path"], "a.txt");
        let response = &body["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "read_file");
        assert_eq!(response["response"]["result"], "file body");
    }

    #[test]
    fn claude_target_preserves_tool_result_shape() {
        let ctx = thinking_ctx("claude-sonnet-4-5-thinking");
        let request = ClaudeRequest {
            model: ctx.model.clone(),
            messages: vec![Message {
                role: "user".into(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_9".into(),
                    content: json!("done"),
                    is_error: None,
                }]),
            }],
            ..Default::default()
        };
        let body = build_generate_request(&request, &ctx).unwrap();
        let part = &body["contents"][0]["parts"][0];
        assert_eq!(part["type"], "tool_result");
        assert_eq!(part["tool_use_id"], "toolu_9");
    }

    #[test]
    fn signed_thinking_becomes_thought_part() {
        let sig = "s".repeat(64);
        let ctx = thinking_ctx("gemini-3-flash-thinking");
        let request = ClaudeRequest {
            model: ctx.model.clone(),
            messages: vec![Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(vec![ContentBlock::Thinking {
                    thinking: "planning".into(),
                    signature: Some(sig.clone()),
                }]),
            }],
            ..Default::default()
        };
        let body = build_generate_request(&request, &ctx).unwrap();
        let part = &body["contents"][0]["parts"][0];
        assert_eq!(part["thought"], true);
        assert_eq!(part["thoughtSignature"], sig.as_str());
    }

    #[test]
    fn generation_config_maps_one_to_one() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            max_tokens: Some(1024),
            temperature: Some(0.7),
            top_p: Some(0.9),
            top_k: Some(40),
            stop_sequences: Some(vec!["END".into()]),
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        let config = &body["generationConfig"];
        assert_eq!(config["maxOutputTokens"], 1024);
        assert_eq!(config["temperature"], 0.7);
        assert_eq!(config["topP"], 0.9);
        assert_eq!(config["topK"], 40);
        assert_eq!(config["stopSequences"][0], "END");
    }

    #[test]
    fn gemini_thinking_gets_default_budget() {
        let ctx = thinking_ctx("gemini-3-flash-thinking");
        let request = ClaudeRequest {
            model: ctx.model.clone(),
            messages: vec![text_message("user", "q")],
            ..Default::default()
        };
        let body = build_generate_request(&request, &ctx).unwrap();
        let thinking = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["includeThoughts"], true);
        assert_eq!(thinking["thinkingBudget"], 16_000);
    }

    #[test]
    fn claude_budget_bumps_max_tokens() {
        let ctx = thinking_ctx("claude-opus-4-5-thinking");
        let request = ClaudeRequest {
            model: ctx.model.clone(),
            max_tokens: Some(4_096),
            thinking: Some(ThinkingRequest {
                kind: Some("enabled".into()),
                budget_tokens: Some(10_000),
            }),
            ..Default::default()
        };
        let body = build_generate_request(&request, &ctx).unwrap();
        let config = &body["generationConfig"];
        assert_eq!(config["thinkingConfig"]["include_thoughts"], true);
        assert_eq!(config["thinkingConfig"]["thinking_budget"], 10_000);
        assert_eq!(config["maxOutputTokens"], 18_192);
    }

    #[test]
    fn gemini_max_tokens_is_capped() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            max_tokens: Some(1_000_000),
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        assert_eq!(
            body["generationConfig"]["maxOutputTokens"],
            constants::GEMINI_MAX_OUTPUT_TOKENS
        );
    }

    #[test]
    fn tools_are_sanitized_into_declarations() {
        let request = ClaudeRequest {
            model: "gemini-3-pro".into(),
            tools: Some(vec![Tool {
                name: "mcp__fs.read".into(),
                description: Some("reads".into()),
                input_schema: Some(json!({
                    "$schema": "x",
                    "type": "object",
                    "properties": {"path": {"type": ["string", "null"]}}
                })),
                parameters: None,
                schema: None,
            }]),
            ..Default::default()
        };
        let body = build_generate_request(&request, &gemini_ctx()).unwrap();
        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "mcp__fs_read");
        assert!(declaration["parameters"].get("$schema").is_none());
        assert_eq!(declaration["parameters"]["properties"]["path"]["type"], "string");
        assert_eq!(
            declaration["parameters"]["properties"]["path"]["nullable"],
            true
        );
    }

    #[test]
    fn cross_family_history_drops_signature_and_closes_tool_loop() {
        // A Gemini-authored assistant turn feeds a Claude thinking request:
        // the foreign signature goes, and the broken tool loop gets its
        // synthetic closure.
        let cache = SignatureCache::fresh();
        let sig = "g".repeat(64);
        cache.record_thinking_signature("gemini plan", &sig, ModelFamily::Gemini);
        let ctx = thinking_ctx("claude-sonnet-4-5-thinking");
        let mut messages = vec![
            Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(vec![
                    ContentBlock::Thinking {
                        thinking: "gemini plan".into(),
                        signature: Some(sig.clone()),
                    },
                    ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "read".into(),
                        input: json!({}),
                        signature: None,
                    },
                ]),
            },
            Message {
                role: "user".into(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".into(),
                    content: json!("ok"),
                    is_error: None,
                }]),
            },
        ];
        prepare_messages(&mut messages, &ctx, &cache);

        // Synthetic assistant + user turns were appended.
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].role, "user");
        // The Gemini signature did not survive.
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            unreachable!()
        };
        assert!(blocks.iter().all(|b| !matches!(
            b,
            ContentBlock::Thinking { signature: Some(_), .. }
        )));
    }

    #[test]
    fn prepare_messages_round_trip_preserves_semantics() {
        // Translate a synthesised request and check canonical order plus
        // signature survival.
        let cache = SignatureCache::fresh();
        let sig = "q".repeat(64);
        cache.record_thinking_signature("plan", &sig, ModelFamily::Gemini);
        let ctx = thinking_ctx("gemini-3-flash-thinking");
        let mut messages = vec![Message {
            role: "assistant".into(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "answer".into() },
                ContentBlock::Thinking {
                    thinking: "plan".into(),
                    signature: None,
                },
            ]),
        }];
        prepare_messages(&mut messages, &ctx, &cache);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            unreachable!()
        };
        // Restored signature, then reordered to thinking-first.
        assert!(matches!(
            &blocks[0],
            ContentBlock::Thinking { signature: Some(s), .. } if *s == sig
        ));
        assert!(matches!(&blocks[1], ContentBlock::Text { .. }));
    }
}
