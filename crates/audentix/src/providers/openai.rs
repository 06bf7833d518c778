use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use super::base::{FinishReason, Provider, ProviderEvent, ProviderStream, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_openai_context_length_error, check_response, messages_to_openai_spec,
    openai_finish_reason, sse_data, tool_request_from_call, tools_to_openai_spec,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage").filter(|usage| !usage.is_null())?;

        let input_tokens = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .or_else(|| match (input_tokens, output_tokens) {
                (Some(input), Some(output)) => Some(input + output),
                _ => None,
            });

        Some(Usage::new(input_tokens, output_tokens, total_tokens))
    }

    fn build_payload(&self, system: &str, messages: &[Message], tools: &[Tool]) -> Result<Value> {
        let system_message = json!({
            "role": "system",
            "content": system
        });

        // create messages array with system message first
        let mut messages_array = vec![system_message];
        messages_array.extend(messages_to_openai_spec(messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": true,
            "stream_options": { "include_usage": true }
        });

        let tools_spec = tools_to_openai_spec(tools)?;
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }

        Ok(payload)
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Collects streamed deltas. Tool call fragments arrive keyed by index and are
/// only emitted once the completion finishes.
#[derive(Debug, Default)]
struct OpenAiStreamState {
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
}

impl OpenAiStreamState {
    fn apply(&mut self, chunk: &Value) -> Result<Vec<ProviderEvent>> {
        if let Some(error) = chunk.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        if let Some(usage) = OpenAiProvider::get_usage(chunk) {
            self.usage = usage;
        }

        let mut events = Vec::new();
        let Some(choice) = chunk["choices"].get(0) else {
            return Ok(events);
        };

        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(ProviderEvent::Text(text.to_string()));
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let partial = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    partial.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    partial.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    partial.arguments.push_str(arguments);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(openai_finish_reason(reason));
        }

        Ok(events)
    }

    fn finish(self) -> Vec<ProviderEvent> {
        let saw_tool_call = !self.tool_calls.is_empty();
        let mut events: Vec<ProviderEvent> = self
            .tool_calls
            .into_values()
            .map(|call| {
                ProviderEvent::ToolRequest(tool_request_from_call(
                    call.id,
                    &call.name,
                    &call.arguments,
                ))
            })
            .collect();

        let reason = match self.finish_reason {
            Some(reason) => reason,
            None if saw_tool_call => FinishReason::ToolCalls,
            None => FinishReason::Other,
        };
        events.push(ProviderEvent::Finish {
            reason,
            usage: self.usage,
        });
        events
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<ProviderStream> {
        let payload = self.build_payload(system, messages, tools)?;
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;
        let mut data = sse_data(check_response("OpenAI", response).await?);

        Ok(Box::pin(async_stream::try_stream! {
            let mut state = OpenAiStreamState::default();
            while let Some(payload) = data.next().await {
                let payload = payload?;
                if payload == "[DONE]" {
                    break;
                }
                let chunk: Value = serde_json::from_str(&payload)?;
                for event in state.apply(&chunk)? {
                    yield event;
                }
            }
            for event in state.finish() {
                yield event;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(chunks: &[Value]) -> String {
        let mut body: String = chunks
            .iter()
            .map(|chunk| format!("data: {}\n\n", chunk))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn _setup_mock_server(body: String) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test_api_key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        // Create the OpenAiProvider with the mock server's URL as the host
        let config = OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        };

        let provider = OpenAiProvider::new(config).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_stream_basic() -> Result<()> {
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello! "}, "finish_reason": null}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "How can I assist you today?"}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 15, "total_tokens": 27}}),
        ]);
        let (server, provider) = _setup_mock_server(body).await;

        let messages = vec![Message::user().with_text("Hello?")];
        let events: Vec<ProviderEvent> = provider
            .stream("You are a helpful assistant.", &messages, &[])
            .await?
            .try_collect()
            .await?;

        assert_eq!(
            events,
            vec![
                ProviderEvent::Text("Hello! ".to_string()),
                ProviderEvent::Text("How can I assist you today?".to_string()),
                ProviderEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage::new(Some(12), Some(15), Some(27)),
                },
            ]
        );

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body)?;
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1]["content"], "Hello?");
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_tool_request() -> Result<()> {
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_123", "type": "function",
                "function": {"name": "submit_contact_form", "arguments": ""}
            }]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "{\"name\":\"Jane\","}
            }]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "\"email\":\"jane@example.com\"}"}
            }]}, "finish_reason": "tool_calls"}]}),
        ]);
        let (_, provider) = _setup_mock_server(body).await;

        let tool = Tool::new(
            "submit_contact_form",
            "Submit a lead",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "email": {"type": "string"}
                },
                "required": ["name", "email"]
            }),
        );

        let events: Vec<ProviderEvent> = provider
            .stream(
                "You are a helpful assistant.",
                &[Message::user().with_text("Contact me")],
                &[tool],
            )
            .await?
            .try_collect()
            .await?;

        assert_eq!(events.len(), 2);
        if let ProviderEvent::ToolRequest(request) = &events[0] {
            assert_eq!(request.id, "call_123");
            let tool_call = request.tool_call.as_ref().unwrap();
            assert_eq!(tool_call.name, "submit_contact_form");
            assert_eq!(
                tool_call.arguments,
                json!({"name": "Jane", "email": "jane@example.com"})
            );
        } else {
            panic!("Expected ToolRequest event");
        }
        assert_eq!(
            events[1],
            ProviderEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: Usage::default(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_context_length_error_chunk() {
        let mut state = OpenAiStreamState::default();
        let err = state
            .apply(&json!({"error": {"code": "context_length_exceeded", "message": "too long"}}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Context length exceeded. Message: too long");
    }
}
