use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::models::message::{Message, ToolRequest};
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Sum two usages, treating a missing count on both sides as unknown
    pub fn combine(&self, other: &Usage) -> Usage {
        fn add(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        Usage::new(
            add(self.input_tokens, other.input_tokens),
            add(self.output_tokens, other.output_tokens),
            add(self.total_tokens, other.total_tokens),
        )
    }
}

/// Why the model stopped generating, named the way the chat widget expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

/// One increment of a streaming completion
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A text delta, forwarded as soon as it arrives
    Text(String),
    /// A complete tool request
    ToolRequest(ToolRequest),
    /// End of the completion
    Finish { reason: FinishReason, usage: Usage },
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent>>;

/// Base trait for AI providers (Gemini, OpenAI, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a streaming completion for the conversation.
    ///
    /// Returns once the provider has accepted the request; events are then
    /// yielded as the model generates them.
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<ProviderStream>;
}
