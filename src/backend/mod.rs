//! Upstream model backends.
//!
//! [`ChatBackend`] is the seam between the gateway and whatever serves the
//! model. The production implementation speaks the OpenAI-compatible chat
//! completions API; tests substitute scripted backends to drive the
//! pipeline without a network.

pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

pub use openai::OpenAiBackend;

/// Token counts reported by the upstream for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A finished, non-streaming model response.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// One increment of a streaming response.
///
/// Either field may be empty: text-only chunks carry generated content,
/// and the upstream's final accounting frame carries usage with no text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Stream of response increments, ending after the upstream closes.
///
/// An `Err` item is terminal; implementations yield nothing after it.
pub type BoxChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

/// Access to the upstream model.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send one prompt and wait for the complete response.
    async fn complete(&self, prompt: &str) -> GatewayResult<Completion>;

    /// Send one prompt and return the response as it is generated.
    async fn stream(&self, prompt: &str) -> GatewayResult<BoxChunkStream>;
}
