use crate::proxy::mappers::claude::models::{ClaudeRequest, ContentBlock, MessageContent};
use sha2::{Digest, Sha256};

// Stable fingerprint for one logical conversation: the SHA-256 of the first
// user message's textual content. Derived purely from the request so repeated
// turns hash identically and sticky selection can keep the upstream prompt
// cache warm.
pub fn session_fingerprint(request: &ClaudeRequest) -> Option<String> {
    let first_user = request.messages.iter().find(|m| m.role == "user")?;
    let text = match &first_user.content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    let digest = Sha256::digest(text.as_bytes());
    Some(format!("{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::claude::models::Message;

    fn request_with(messages: Vec<Message>) -> ClaudeRequest {
        ClaudeRequest {
            model: "gemini-3-pro".into(),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let req = request_with(vec![Message {
            role: "user".into(),
            content: MessageContent::Text("hello there".into()),
        }]);
        let a = session_fingerprint(&req).unwrap();
        let b = session_fingerprint(&req).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_uses_first_user_message_only() {
        let first = request_with(vec![
            Message {
                role: "user".into(),
                content: MessageContent::Text("turn one".into()),
            },
            Message {
                role: "assistant".into(),
                content: MessageContent::Text("answer".into()),
            },
        ]);
        let longer = request_with(vec![
            Message {
                role: "user".into(),
                content: MessageContent::Text("turn one".into()),
            },
            Message {
                role: "assistant".into(),
                content: MessageContent::Text("answer".into()),
            },
            Message {
                role: "user".into(),
                content: MessageContent::Text("turn two".into()),
            },
        ]);
        assert_eq!(session_fingerprint(&first), session_fingerprint(&longer));
    }

    #[test]
    fn block_content_hashes_text_blocks() {
        let req = request_with(vec![Message {
            role: "user".into(),
            content: MessageContent::Blocks(vec![ContentBlock::Text {
                text: "hello there".into(),
            }]),
        }]);
        let plain = request_with(vec![Message {
            role: "user".into(),
            content: MessageContent::Text("hello there".into()),
        }]);
        assert_eq!(session_fingerprint(&req), session_fingerprint(&plain));
    }

    #[test]
    fn no_user_message_means_no_fingerprint() {
        let req = request_with(vec![Message {
            role: "assistant".into(),
            content: MessageContent::Text("hi".into()),
        }]);
        assert!(session_fingerprint(&req).is_none());
    }
}
