use super::models::{ContentBlock, Message, MessageContent};
use crate::proxy::signature_cache::{ModelFamily, SignatureCache, MIN_SIGNATURE_LENGTH};
use tracing::{debug, info};

// Restores signatures that intermediate clients stripped from thinking
// blocks, keyed by the block's own text.
pub fn restore_signatures(messages: &mut [Message], cache: &SignatureCache) {
    for msg in messages.iter_mut().filter(|m| m.role == "assistant") {
        let MessageContent::Blocks(blocks) = &mut msg.content else {
            continue;
        };
        for block in blocks.iter_mut() {
            if let ContentBlock::Thinking {
                thinking,
                signature,
            } = block
            {
                if signature.is_none() {
                    if let Some((restored, _)) = cache.restore_thinking_signature(thinking) {
                        debug!(
                            "restored thinking signature from cache (len {})",
                            restored.len()
                        );
                        *signature = Some(restored);
                    }
                }
            }
        }
    }
}

// Drops signatures the target family cannot validate. A Gemini-minted
// signature in a Claude-bound history (or vice versa) would be rejected
// upstream, so cross-family signatures always go. For Gemini targets,
// signatures with no cached provenance go too; Claude targets keep them and
// let the upstream validate.
pub fn filter_incompatible_signatures(
    messages: &mut [Message],
    target: ModelFamily,
    cache: &SignatureCache,
) {
    let mut dropped = 0usize;
    for msg in messages.iter_mut().filter(|m| m.role == "assistant") {
        let MessageContent::Blocks(blocks) = &mut msg.content else {
            continue;
        };
        for block in blocks.iter_mut() {
            let signature = match block {
                ContentBlock::Thinking { signature, .. } => signature,
                ContentBlock::ToolUse { signature, .. } => signature,
                _ => continue,
            };
            let Some(sig) = signature.as_deref() else {
                continue;
            };
            if sig.len() < MIN_SIGNATURE_LENGTH {
                *signature = None;
                dropped += 1;
                continue;
            }
            match cache.family_of(sig) {
                Some(family) if family != target => {
                    *signature = None;
                    dropped += 1;
                }
                None if target == ModelFamily::Gemini => {
                    *signature = None;
                    dropped += 1;
                }
                _ => {}
            }
        }
    }
    if dropped > 0 {
        info!(
            "dropped {} signatures incompatible with the {} family",
            dropped,
            target.label()
        );
    }
}

// Unsigned thinking blocks at the tail of an assistant turn cannot be sent
// back upstream; they are removed outright.
pub fn strip_trailing_unsigned_thinking(messages: &mut [Message]) {
    for msg in messages.iter_mut().filter(|m| m.role == "assistant") {
        let MessageContent::Blocks(blocks) = &mut msg.content else {
            continue;
        };
        while let Some(ContentBlock::Thinking {
            signature: None, ..
        }) = blocks.last()
        {
            blocks.pop();
        }
    }
}

// The upstream requires assistant content in [thinking..., text...,
// tool_use...] order. Stable sort keeps relative order inside each class.
pub fn reorder_blocks(messages: &mut [Message]) {
    for msg in messages.iter_mut().filter(|m| m.role == "assistant") {
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            blocks.sort_by_key(block_rank);
        }
    }
}

fn block_rank(block: &ContentBlock) -> u8 {
    match block {
        ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => 0,
        ContentBlock::ToolUse { .. } => 2,
        _ => 1,
    }
}

fn has_signed_thinking(msg: &Message) -> bool {
    let MessageContent::Blocks(blocks) = &msg.content else {
        return false;
    };
    blocks.iter().any(|b| {
        matches!(
            b,
            ContentBlock::Thinking {
                signature: Some(sig),
                thinking,
            } if sig.len() >= MIN_SIGNATURE_LENGTH && !thinking.is_empty()
        )
    })
}

fn has_tool_use(msg: &Message) -> bool {
    let MessageContent::Blocks(blocks) = &msg.content else {
        return false;
    };
    blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
}

fn has_tool_result(msg: &Message) -> bool {
    let MessageContent::Blocks(blocks) = &msg.content else {
        return false;
    };
    blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
}

// Thinking models refuse a tool loop whose assistant turn lost its signed
// thinking block (typically after cross-family filtering). Injecting a
// synthetic closing exchange turns the broken loop into a completed one the
// upstream will accept.
pub fn close_tool_loop(messages: &mut Vec<Message>) {
    let Some(last_assistant_idx) = messages.iter().rposition(|m| m.role == "assistant") else {
        return;
    };
    if !has_tool_use(&messages[last_assistant_idx]) {
        return;
    }
    let Some(last) = messages.last() else {
        return;
    };
    if last.role != "user" || !has_tool_result(last) {
        return;
    }
    if has_signed_thinking(&messages[last_assistant_idx]) {
        return;
    }

    info!("tool loop missing signed thinking, injecting synthetic closure");
    messages.push(Message {
        role: "assistant".to_string(),
        content: MessageContent::Blocks(vec![ContentBlock::Text {
            text: "[Tool execution completed. Proceeding to the final response.]".to_string(),
        }]),
    });
    messages.push(Message {
        role: "user".to_string(),
        content: MessageContent::Blocks(vec![ContentBlock::Text {
            text: "Continue with the final result based on the tool output above.".to_string(),
        }]),
    });
}
