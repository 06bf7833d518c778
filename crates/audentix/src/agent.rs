use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capabilities::Capability;
use crate::errors::{AgentError, AgentResult};
use crate::models::message::{Message, MessageContent, ToolRequest, ToolResponse};
use crate::models::tool::{Tool, ToolCall};
use crate::prompt_template::{load_prompt_file, CompanyProfile};
use crate::providers::base::{FinishReason, Provider, ProviderEvent, Usage};

pub const DEFAULT_MAX_STEPS: usize = 3;

#[derive(Serialize)]
struct SystemPromptContext<'a> {
    company: &'a CompanyProfile,
    tools: Vec<Tool>,
}

/// Everything the agent produces while answering, in the order it happens
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A provider call is about to start
    StepStart { message_id: String },
    Text(String),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    /// A provider call finished. `is_continued` is set when another step follows.
    StepFinish {
        reason: FinishReason,
        usage: Usage,
        is_continued: bool,
    },
    /// The reply is complete, with usage summed over all steps
    Finish { reason: FinishReason, usage: Usage },
}

/// Agent integrates a foundational LLM with the capabilities it may invoke
pub struct Agent {
    provider: Arc<dyn Provider>,
    capabilities: Vec<Arc<dyn Capability>>,
    system_prompt: String,
    max_steps: usize,
}

impl Agent {
    /// Create a new Agent and render its system prompt for the given capabilities
    pub fn new(
        provider: Arc<dyn Provider>,
        capabilities: Vec<Arc<dyn Capability>>,
        company: &CompanyProfile,
    ) -> AgentResult<Self> {
        let context = SystemPromptContext {
            company,
            tools: capabilities.iter().map(|c| c.tool()).collect(),
        };
        let system_prompt = load_prompt_file("system.md", &context)
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        Ok(Self {
            provider,
            capabilities,
            system_prompt,
            max_steps: DEFAULT_MAX_STEPS,
        })
    }

    /// Limit the number of provider calls per reply. At least one call is always made.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.capabilities.iter().map(|c| c.tool()).collect()
    }

    /// Dispatch a single tool call to the capability registered under its name
    async fn dispatch_tool_call(
        &self,
        tool_call: AgentResult<ToolCall>,
    ) -> AgentResult<serde_json::Value> {
        let call = tool_call?;
        let capability = self
            .capabilities
            .iter()
            .find(|capability| capability.name() == call.name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;

        // Runs on its own task so a dropped reply stream cannot cut a call short
        tokio::spawn(async move { capability.execute(call.arguments).await })
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?
    }

    /// Create a stream that yields each event as it's generated by the agent.
    ///
    /// The conversation is copied; tool requests and responses from earlier
    /// steps are appended to the copy so later steps can see them.
    pub fn reply(&self, messages: &[Message]) -> BoxStream<'_, Result<AgentEvent>> {
        let mut messages = messages.to_vec();
        let tools = self.tools();

        Box::pin(async_stream::try_stream! {
            let mut total_usage = Usage::default();
            let mut step = 0;

            loop {
                step += 1;
                yield AgentEvent::StepStart {
                    message_id: format!("msg-{}", Uuid::new_v4()),
                };

                let mut events = self
                    .provider
                    .stream(&self.system_prompt, &messages, &tools)
                    .await?;

                let mut text = String::new();
                let mut requests: Vec<ToolRequest> = Vec::new();
                let mut finish_reason = FinishReason::Other;
                let mut usage = Usage::default();

                while let Some(event) = events.next().await {
                    match event? {
                        ProviderEvent::Text(delta) => {
                            text.push_str(&delta);
                            yield AgentEvent::Text(delta);
                        }
                        ProviderEvent::ToolRequest(request) => {
                            requests.push(request.clone());
                            yield AgentEvent::ToolRequest(request);
                        }
                        ProviderEvent::Finish { reason, usage: step_usage } => {
                            finish_reason = reason;
                            usage = step_usage;
                        }
                    }
                }
                total_usage = total_usage.combine(&usage);

                if requests.is_empty() {
                    yield AgentEvent::StepFinish {
                        reason: finish_reason,
                        usage,
                        is_continued: false,
                    };
                    yield AgentEvent::Finish {
                        reason: finish_reason,
                        usage: total_usage,
                    };
                    break;
                }

                let mut response = Message::assistant();
                if !text.is_empty() {
                    response = response.with_text(text);
                }

                // Dispatch one at a time so side effects happen in the order the model asked
                let mut message_tool_response = Message::user();
                for request in requests {
                    debug!(tool = request.tool_name().unwrap_or("<invalid>"), "Dispatching tool call");
                    let output = self.dispatch_tool_call(request.tool_call.clone()).await;
                    if let Err(e) = &output {
                        warn!("Tool call {} failed: {}", request.id, e);
                    }

                    yield AgentEvent::ToolResponse(ToolResponse {
                        id: request.id.clone(),
                        tool_result: output.clone(),
                    });

                    message_tool_response =
                        message_tool_response.with_tool_response(request.id.clone(), output);
                    response = response.with_content(MessageContent::ToolRequest(request));
                }

                messages.push(response);
                messages.push(message_tool_response);

                let is_continued = step < self.max_steps;
                yield AgentEvent::StepFinish {
                    reason: finish_reason,
                    usage,
                    is_continued,
                };

                if !is_continued {
                    yield AgentEvent::Finish {
                        reason: finish_reason,
                        usage: total_usage,
                    };
                    break;
                }
            }
        })
    }
}
