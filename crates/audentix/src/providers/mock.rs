use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;
use crate::providers::base::{
    FinishReason, Provider, ProviderEvent, ProviderStream, Usage,
};

enum Turn {
    Events(Vec<ProviderEvent>),
    Error(String),
}

/// A mock provider that replays pre-configured turns for testing
#[derive(Clone)]
pub struct MockProvider {
    turns: Arc<Mutex<VecDeque<Turn>>>,
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses. Each message is
    /// streamed as its content, followed by a finish event.
    pub fn new(responses: Vec<Message>) -> Self {
        let turns = responses.into_iter().map(|message| {
            let mut events: Vec<ProviderEvent> = message
                .content
                .into_iter()
                .filter_map(|content| match content {
                    MessageContent::Text(text) => Some(ProviderEvent::Text(text.text)),
                    MessageContent::ToolRequest(request) => {
                        Some(ProviderEvent::ToolRequest(request))
                    }
                    MessageContent::ToolResponse(_) => None,
                })
                .collect();
            let reason = if events
                .iter()
                .any(|event| matches!(event, ProviderEvent::ToolRequest(_)))
            {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            };
            events.push(ProviderEvent::Finish {
                reason,
                usage: Usage::default(),
            });
            Turn::Events(events)
        });

        Self {
            turns: Arc::new(Mutex::new(turns.collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a turn made of raw events, streamed as given
    pub fn with_events(self, events: Vec<ProviderEvent>) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(Turn::Events(events));
        }
        self
    }

    /// Queue a turn whose stream fails partway with `message`
    pub fn with_error(self, message: impl Into<String>) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(Turn::Error(message.into()));
        }
        self
    }

    /// The conversations the provider was called with, in order
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        _system_prompt: &str,
        messages: &[Message],
        _tools: &[Tool],
    ) -> Result<ProviderStream> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("mock provider lock poisoned"))?
            .push(messages.to_vec());

        let turn = self
            .turns
            .lock()
            .map_err(|_| anyhow!("mock provider lock poisoned"))?
            .pop_front();

        let items: Vec<Result<ProviderEvent>> = match turn {
            Some(Turn::Events(events)) => events.into_iter().map(Ok).collect(),
            Some(Turn::Error(message)) => vec![
                Ok(ProviderEvent::Text("Partial".to_string())),
                Err(anyhow!(message)),
            ],
            // Return an empty completion if no more pre-configured responses
            None => vec![Ok(ProviderEvent::Finish {
                reason: FinishReason::Stop,
                usage: Usage::default(),
            })],
        };

        Ok(Box::pin(stream::iter(items)))
    }
}
