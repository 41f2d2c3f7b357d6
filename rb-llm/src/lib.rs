//! Text-generation client for relaybot.
//!
//! Pure HTTP client against the generateContent API. Priority models are
//! tried in order, then the designated fallback model.

mod client;
mod error;
mod gemini;
mod types;

pub use client::{Completion, LlmClient, ModelChain};
pub use error::{LlmError, Result};
pub use gemini::{DEFAULT_API_BASE_URL, GeminiClient};
pub use types::{Content, GenerateContentRequest, GenerateContentResponse, Part, PromptShape};
