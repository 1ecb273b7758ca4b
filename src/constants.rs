use once_cell::sync::Lazy;

// Upstream endpoint mirrors, tried in order per attempt. The daily sandbox
// mirror tends to carry looser quota than prod, so it goes first.
pub const UPSTREAM_MIRRORS: [&str; 2] = [
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal",
    "https://cloudcode-pa.googleapis.com/v1internal",
];

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const OAUTH_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const OAUTH_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
pub const OAUTH_CALLBACK_PORT: u16 = 51121;
pub const OAUTH_SCOPES: &str = concat!(
    "https://www.googleapis.com/auth/cloud-platform ",
    "https://www.googleapis.com/auth/userinfo.email ",
    "https://www.googleapis.com/auth/userinfo.profile"
);

// Used when the upstream refuses to hand out a companion project for an
// account. Requests still succeed against the shared default.
pub const DEFAULT_PROJECT_ID: &str = "bamboo-precept-lgxtn";

pub const ANTHROPIC_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

pub const DEFAULT_THINKING_BUDGET: u32 = 16_000;
pub const THINKING_MAX_TOKENS_MARGIN: u32 = 8_192;
pub const GEMINI_MAX_OUTPUT_TOKENS: u32 = 65_536;

// Model ids served on /v1/models, with the family that validates their
// thinking signatures.
pub const MODEL_CATALOG: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "claude"),
    ("claude-sonnet-4-5-thinking", "claude"),
    ("claude-opus-4-5-thinking", "claude"),
    ("gemini-3-pro", "gemini"),
    ("gemini-3-flash", "gemini"),
    ("gemini-3-flash-thinking", "gemini"),
];

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "viaduct/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub fn is_claude_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("claude")
}

pub fn is_thinking_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("thinking")
}
