//! OpenAI-compatible front end for GitHub Copilot chat.
//!
//! Normalizes inbound chat-completion requests, forwards them to the Copilot
//! chat endpoint with an exchanged session token and translates the answer
//! back into the OpenAI wire format.
//!
//! # Components
//!
//! - [`chat`]: request normalization and OpenAI wire types
//! - [`upstream`]: Copilot chat client
//! - [`stream`]: SSE reframing for `stream: true`
//! - [`aggregate`]: response reshaping for `stream: false`
//! - [`server`]: axum router, API-key guard and device-login endpoints

pub mod aggregate;
pub mod chat;
pub mod error;
pub mod server;
pub mod stream;
pub mod upstream;

pub use aggregate::AggregateTranslator;
pub use chat::{ChatCompletion, ChatMessage, ChatRequest, RequestDefaults, StreamChunk};
pub use error::{ProxyError, Result};
pub use server::{DeviceLogin, ProxyConfig, ProxyServer};
pub use stream::{DONE_FRAME, FrameStream, SseLineDecoder, StreamTranslator};
pub use upstream::{CopilotClient, UpstreamConfig};
