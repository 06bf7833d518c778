use anyhow::{anyhow, Result};
use futures::stream::{BoxStream, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Response, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

use super::base::FinishReason;
use crate::errors::AgentError;
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Splits a server-sent event byte stream into the payloads of its `data:` lines.
///
/// Chunks from the network can end anywhere, including mid-line or mid-codepoint,
/// so bytes are held until a newline completes the line.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    /// Append a chunk and return the payload of every `data:` line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// The payload of a trailing `data:` line that was never newline terminated
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_string())
    }
}

/// Stream the `data:` payloads of an event-stream response as they arrive
pub fn sse_data(response: Response) -> BoxStream<'static, Result<String>> {
    Box::pin(async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = SseBuffer::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for payload in buffer.push(&chunk) {
                yield payload;
            }
        }

        if let Some(payload) = buffer.finish() {
            yield payload;
        }
    })
}

/// Pass a successful response through, or turn the status and body into an error
pub async fn check_response(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => Err(
            anyhow!("{} server error: {}\n{}", provider, status, body),
        ),
        _ => Err(anyhow!("{} request failed: {}\n{}", provider, status, body)),
    }
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });

        let mut output = Vec::new();
        let text = message.text();
        if !text.is_empty() {
            converted["content"] = json!(text);
        }

        for content in &message.content {
            match content {
                MessageContent::Text(_) => {}
                MessageContent::ToolRequest(request) => match &request.tool_call {
                    Ok(tool_call) => {
                        let sanitized_name = sanitize_function_name(&tool_call.name);
                        if let Some(object) = converted.as_object_mut() {
                            let tool_calls = object.entry("tool_calls").or_insert(json!([]));
                            if let Some(array) = tool_calls.as_array_mut() {
                                array.push(json!({
                                    "id": request.id,
                                    "type": "function",
                                    "function": {
                                        "name": sanitized_name,
                                        "arguments": tool_call.arguments.to_string(),
                                    }
                                }));
                            }
                        }
                    }
                    Err(e) => {
                        output.push(json!({
                            "role": "tool",
                            "content": format!("Error: {}", e),
                            "tool_call_id": request.id
                        }));
                    }
                },
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(result) => {
                        output.push(json!({
                            "role": "tool",
                            "content": result.to_string(),
                            "tool_call_id": response.id
                        }));
                    }
                    Err(e) => {
                        // A tool result error is shown as output so the model can interpret the error message
                        output.push(json!({
                            "role": "tool",
                            "content": format!("The tool call returned the following error:\n{}", e),
                            "tool_call_id": response.id
                        }));
                    }
                },
            }
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    ensure_unique_names(tools)?;
    Ok(tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect())
}

/// Build a tool request from a function call, keeping unusable calls as errors so
/// the model still gets a response for them
pub fn tool_request_from_call(id: String, name: &str, arguments: &str) -> ToolRequest {
    if !is_valid_function_name(name) {
        let error = AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            name
        ));
        return ToolRequest {
            id,
            tool_call: Err(error),
        };
    }

    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    let tool_call = serde_json::from_str::<Value>(arguments)
        .map(|params| ToolCall::new(name, params))
        .map_err(|e| {
            AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ))
        });
    ToolRequest { id, tool_call }
}

pub fn openai_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

/// Convert internal Message format to the Gemini `contents` list.
///
/// Returns the text of any system messages separately, since Gemini only
/// accepts those as part of the system instruction.
pub fn messages_to_google_spec(messages: &[Message]) -> (Vec<String>, Vec<Value>) {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    let mut tool_names: HashMap<&str, &str> = HashMap::new();

    for message in messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                system.push(text);
            }
            continue;
        }

        let mut parts = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        parts.push(json!({ "text": text.text }));
                    }
                }
                MessageContent::ToolRequest(request) => {
                    if let Ok(tool_call) = &request.tool_call {
                        tool_names.insert(&request.id, &tool_call.name);
                        parts.push(json!({
                            "functionCall": {
                                "name": tool_call.name,
                                "args": tool_call.arguments,
                            }
                        }));
                    }
                }
                MessageContent::ToolResponse(response) => {
                    match tool_names.get(response.id.as_str()) {
                        Some(name) => parts.push(json!({
                            "functionResponse": {
                                "name": name,
                                "response": function_response(&response.tool_result),
                            }
                        })),
                        // Gemini has no way to answer a call it never made, so the
                        // outcome goes back as plain text instead
                        None => parts.push(json!({
                            "text": format!(
                                "The tool call returned the following result:\n{}",
                                function_response(&response.tool_result)
                            )
                        })),
                    }
                }
            }
        }

        if parts.is_empty() {
            continue;
        }

        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        contents.push(json!({ "role": role, "parts": parts }));
    }

    (system, contents)
}

fn function_response(result: &Result<Value, AgentError>) -> Value {
    match result {
        Ok(Value::Object(object)) => Value::Object(object.clone()),
        Ok(other) => {
            let mut object = Map::new();
            object.insert("result".to_string(), other.clone());
            Value::Object(object)
        }
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Convert internal Tool format to Gemini's function declarations
pub fn tools_to_google_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    ensure_unique_names(tools)?;
    if tools.is_empty() {
        return Ok(vec![]);
    }

    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            })
        })
        .collect();
    Ok(vec![json!({ "functionDeclarations": declarations })])
}

pub fn google_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Other,
    }
}

fn ensure_unique_names(tools: &[Tool]) -> Result<()> {
    let mut tool_names = HashSet::new();
    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
    }
    Ok(())
}

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

fn is_valid_function_name(name: &str) -> bool {
    FUNCTION_NAME.is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
