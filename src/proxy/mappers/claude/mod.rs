pub mod collector;
pub mod models;
pub mod request;
pub mod response;
pub mod streaming;
pub mod thinking;

pub use collector::collect_stream_to_message;
pub use request::{build_generate_request, prepare_messages, TranslationContext};
pub use response::to_claude_response;
pub use streaming::{translate_sse_stream, StreamContext};
