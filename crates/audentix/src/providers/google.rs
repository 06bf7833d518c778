use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::base::{FinishReason, Provider, ProviderEvent, ProviderStream, Usage};
use super::configs::GoogleProviderConfig;
use super::utils::{
    check_response, google_finish_reason, messages_to_google_spec, sse_data,
    tool_request_from_call, tools_to_google_spec,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

/// Streams completions from the Gemini API
pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn build_payload(&self, system: &str, messages: &[Message], tools: &[Tool]) -> Result<Value> {
        let (extra_system, contents) = messages_to_google_spec(messages);

        let mut system_parts = vec![json!({ "text": system })];
        system_parts.extend(extra_system.into_iter().map(|text| json!({ "text": text })));

        let mut payload = json!({
            "systemInstruction": { "parts": system_parts },
            "contents": contents,
        });

        let tools_spec = tools_to_google_spec(tools)?;
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temp) = self.config.temperature {
            generation_config.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        Ok(payload)
    }
}

/// Folds the chunks of one streamed completion into provider events
#[derive(Debug, Default)]
struct GoogleStreamState {
    saw_tool_call: bool,
    finish_reason: Option<FinishReason>,
    usage: Usage,
}

impl GoogleStreamState {
    fn apply(&mut self, chunk: &Value) -> Result<Vec<ProviderEvent>> {
        if let Some(error) = chunk.get("error") {
            return Err(anyhow!("Gemini API error: {}", error));
        }

        if let Some(usage) = chunk.get("usageMetadata") {
            let count = |key: &str| usage.get(key).and_then(Value::as_i64).map(|v| v as i32);
            self.usage = Usage::new(
                count("promptTokenCount"),
                count("candidatesTokenCount"),
                count("totalTokenCount"),
            );
        }

        if chunk["promptFeedback"]["blockReason"].is_string() {
            self.finish_reason = Some(FinishReason::ContentFilter);
        }

        let candidate = &chunk["candidates"][0];
        let mut events = Vec::new();

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                // Thought summaries are not part of the answer
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    continue;
                }

                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(ProviderEvent::Text(text.to_string()));
                    }
                }

                if let Some(function_call) = part.get("functionCall") {
                    self.saw_tool_call = true;
                    let name = function_call["name"].as_str().unwrap_or_default();
                    let arguments = function_call
                        .get("args")
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    // Gemini does not assign call ids, so each request gets its own
                    events.push(ProviderEvent::ToolRequest(tool_request_from_call(
                        Uuid::new_v4().to_string(),
                        name,
                        &arguments.to_string(),
                    )));
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            self.finish_reason = Some(google_finish_reason(reason));
        }

        Ok(events)
    }

    fn finish(self) -> ProviderEvent {
        // Gemini reports STOP even when the turn ended on a function call
        let reason = match self.finish_reason {
            None | Some(FinishReason::Stop) if self.saw_tool_call => FinishReason::ToolCalls,
            Some(reason) => reason,
            None => FinishReason::Other,
        };
        ProviderEvent::Finish {
            reason,
            usage: self.usage,
        }
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<ProviderStream> {
        let payload = self.build_payload(system, messages, tools)?;
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.host.trim_end_matches('/'),
            self.config.model
        );

        debug!(model = %self.config.model, messages = messages.len(), "Opening Gemini stream");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        let mut data = sse_data(check_response("Gemini", response).await?);

        Ok(Box::pin(async_stream::try_stream! {
            let mut state = GoogleStreamState::default();
            while let Some(payload) = data.next().await {
                let chunk: Value = serde_json::from_str(&payload?)?;
                for event in state.apply(&chunk)? {
                    yield event;
                }
            }
            yield state.finish();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(chunks: &[Value]) -> String {
        chunks
            .iter()
            .map(|chunk| format!("data: {}\r\n\r\n", chunk))
            .collect()
    }

    async fn setup_mock_server(status: u16, body: String) -> (MockServer, GoogleProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test_api_key"))
            .respond_with(
                ResponseTemplate::new(status)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(GoogleProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        })
        .unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_stream_text() -> Result<()> {
        let body = sse_body(&[
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hello! "}]}}]}),
            json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "How can we help?"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 6, "totalTokenCount": 18}
            }),
        ]);
        let (server, provider) = setup_mock_server(200, body).await;

        let messages = vec![Message::user().with_text("Hi")];
        let events: Vec<ProviderEvent> = provider
            .stream("You are a helpful assistant.", &messages, &[])
            .await?
            .try_collect()
            .await?;

        assert_eq!(
            events,
            vec![
                ProviderEvent::Text("Hello! ".to_string()),
                ProviderEvent::Text("How can we help?".to_string()),
                ProviderEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage::new(Some(12), Some(6), Some(18)),
                },
            ]
        );

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body)?;
        assert_eq!(
            sent["systemInstruction"]["parts"][0]["text"],
            "You are a helpful assistant."
        );
        assert_eq!(sent["contents"][0]["parts"][0]["text"], "Hi");
        assert_eq!(sent["generationConfig"]["temperature"], json!(0.7f32));
        assert!(sent.get("tools").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_function_call() -> Result<()> {
        let body = sse_body(&[json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{
                    "functionCall": {
                        "name": "submit_contact_form",
                        "args": {"name": "Jane Doe", "email": "jane@example.com", "message": "Need a quote"}
                    }
                }]},
                "finishReason": "STOP"
            }]
        })]);
        let (server, provider) = setup_mock_server(200, body).await;

        let tool = Tool::new(
            "submit_contact_form",
            "Submit a lead",
            json!({"type": "object", "properties": {"name": {"type": "string"}}}),
        );
        let events: Vec<ProviderEvent> = provider
            .stream("system", &[Message::user().with_text("Send it")], &[tool])
            .await?
            .try_collect()
            .await?;

        assert_eq!(events.len(), 2);
        match &events[0] {
            ProviderEvent::ToolRequest(request) => {
                let call = request.tool_call.as_ref().unwrap();
                assert_eq!(call.name, "submit_contact_form");
                assert_eq!(call.arguments["email"], "jane@example.com");
                assert!(!request.id.is_empty());
            }
            other => panic!("Expected tool request, got {:?}", other),
        }
        assert!(matches!(
            events[1],
            ProviderEvent::Finish {
                reason: FinishReason::ToolCalls,
                ..
            }
        ));

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body)?;
        assert_eq!(
            sent["tools"][0]["functionDeclarations"][0]["name"],
            "submit_contact_form"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_skips_thoughts() -> Result<()> {
        let body = sse_body(&[json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "planning...", "thought": true},
                    {"text": "Answer"}
                ]},
                "finishReason": "MAX_TOKENS"
            }]
        })]);
        let (_server, provider) = setup_mock_server(200, body).await;

        let events: Vec<ProviderEvent> = provider
            .stream("system", &[Message::user().with_text("Hi")], &[])
            .await?
            .try_collect()
            .await?;

        assert_eq!(events[0], ProviderEvent::Text("Answer".to_string()));
        assert!(matches!(
            events[1],
            ProviderEvent::Finish {
                reason: FinishReason::Length,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_rejected_request() {
        let (_server, provider) =
            setup_mock_server(400, "{\"error\": {\"message\": \"API key not valid\"}}".to_string())
                .await;

        let result = provider
            .stream("system", &[Message::user().with_text("Hi")], &[])
            .await;

        let err = result.err().expect("request should fail");
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn test_system_messages_join_instruction() -> Result<()> {
        let provider = GoogleProvider::new(GoogleProviderConfig {
            host: "http://localhost".to_string(),
            api_key: "key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: None,
            max_tokens: Some(512),
        })?;

        let payload = provider.build_payload(
            "Base prompt",
            &[
                Message::system().with_text("Prefer short answers."),
                Message::user().with_text("Hi"),
            ],
            &[],
        )?;

        assert_eq!(payload["systemInstruction"]["parts"][1]["text"], "Prefer short answers.");
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 512);
        Ok(())
    }

    #[test]
    fn test_mid_stream_error_chunk() {
        let mut state = GoogleStreamState::default();
        let result = state.apply(&json!({"error": {"code": 500, "message": "internal"}}));
        assert!(result.unwrap_err().to_string().contains("internal"));
    }
}
