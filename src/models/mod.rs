pub mod chat;

pub use chat::{ChatBackend, ChatRequest, OpenAiChatClient};
