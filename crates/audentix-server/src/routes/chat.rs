use crate::configuration::StreamProtocol;
use crate::error::ChatError;
use crate::state::AppState;
use audentix::{
    agent::AgentEvent,
    models::message::Message,
    models::tool::ToolCall,
    providers::base::{FinishReason, Usage},
};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use futures::{stream::StreamExt, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

// Shown to the browser in place of upstream failure details
const STREAM_ERROR: &str = "An error occurred.";

// Types matching the incoming JSON structure
#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    parts: Vec<MessagePart>,
    #[serde(default)]
    #[serde(rename = "toolInvocations")]
    tool_invocations: Vec<ToolInvocation>,
}

impl IncomingMessage {
    /// The message text, falling back to the text parts when `content` is empty
    fn text(&self) -> String {
        match self.content.as_deref() {
            Some(content) if !content.is_empty() => content.to_string(),
            _ => self
                .parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolInvocation {
    state: String,
    #[serde(rename = "toolCallId")]
    tool_call_id: String,
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    result: Option<Value>,
}

// Custom response type for the streamed reply
pub struct StreamResponse {
    rx: ReceiverStream<String>,
    protocol: StreamProtocol,
}

impl StreamResponse {
    fn new(rx: ReceiverStream<String>, protocol: StreamProtocol) -> Self {
        Self { rx, protocol }
    }
}

impl Stream for StreamResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for StreamResponse {
    fn into_response(self) -> Response {
        let protocol = self.protocol;
        let body = Body::from_stream(self);
        let headers = [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ];

        match protocol {
            StreamProtocol::Data => {
                (headers, [("x-vercel-ai-data-stream", "v1")], body).into_response()
            }
            StreamProtocol::Text => (headers, body).into_response(),
        }
    }
}

// Convert incoming messages to our internal Message type
fn convert_messages(incoming: &[IncomingMessage]) -> Vec<Message> {
    let mut messages = Vec::new();

    for msg in incoming {
        let text = msg.text();
        match msg.role.as_str() {
            "user" | "tool" => {
                if !text.is_empty() {
                    messages.push(Message::user().with_text(text));
                }
            }
            "system" => {
                if !text.is_empty() {
                    messages.push(Message::system().with_text(text));
                }
            }
            "assistant" => {
                // First handle any tool invocations - each represents a complete request/response cycle
                for tool in &msg.tool_invocations {
                    if tool.state != "result" {
                        continue;
                    }
                    let tool_call = ToolCall::new(tool.tool_name.clone(), tool.args.clone());
                    messages.push(
                        Message::assistant()
                            .with_tool_request(tool.tool_call_id.clone(), Ok(tool_call)),
                    );

                    let result = tool.result.clone().unwrap_or(Value::Null);
                    messages.push(
                        Message::user().with_tool_response(tool.tool_call_id.clone(), Ok(result)),
                    );
                }

                // Then add the assistant's text response after tool interactions
                if !text.is_empty() {
                    messages.push(Message::assistant().with_text(text));
                }
            }
            "data" => {
                debug!("Dropping data message");
            }
            other => {
                warn!("Unknown role: {}", other);
            }
        }
    }

    messages
}

// Protocol-specific message formatting
struct ProtocolFormatter;

impl ProtocolFormatter {
    fn format_step_start(message_id: &str) -> String {
        format!("f:{}\n", json!({ "messageId": message_id }))
    }

    fn format_text(text: &str) -> String {
        let encoded_text = serde_json::to_string(text).unwrap_or_else(|_| String::new());
        format!("0:{}\n", encoded_text)
    }

    fn format_tool_call(id: &str, name: &str, args: &Value) -> String {
        // Tool calls start with "9:"
        let tool_call = json!({
            "toolCallId": id,
            "toolName": name,
            "args": args
        });
        format!("9:{}\n", tool_call)
    }

    fn format_tool_response(id: &str, result: &Value) -> String {
        // Tool responses start with "a:"
        let response = json!({
            "toolCallId": id,
            "result": result,
        });
        format!("a:{}\n", response)
    }

    fn usage(usage: &Usage) -> Value {
        json!({
            "promptTokens": usage.input_tokens.unwrap_or(0),
            "completionTokens": usage.output_tokens.unwrap_or(0)
        })
    }

    fn format_step_finish(reason: FinishReason, usage: &Usage, is_continued: bool) -> String {
        let finish = json!({
            "finishReason": reason,
            "usage": Self::usage(usage),
            "isContinued": is_continued
        });
        format!("e:{}\n", finish)
    }

    fn format_finish(reason: FinishReason, usage: &Usage) -> String {
        // Finish messages start with "d:"
        let finish = json!({
            "finishReason": reason,
            "usage": Self::usage(usage)
        });
        format!("d:{}\n", finish)
    }

    fn format_error(message: &str) -> String {
        let encoded = serde_json::to_string(message).unwrap_or_else(|_| String::new());
        format!("3:{}\n", encoded)
    }

    /// Encode one agent event, or None when the protocol has no representation for it
    fn encode(protocol: StreamProtocol, event: AgentEvent) -> Option<String> {
        if protocol == StreamProtocol::Text {
            return match event {
                AgentEvent::Text(text) => Some(text),
                _ => None,
            };
        }

        let encoded = match event {
            AgentEvent::StepStart { message_id } => Self::format_step_start(&message_id),
            AgentEvent::Text(text) => Self::format_text(&text),
            AgentEvent::ToolRequest(request) => match request.tool_call {
                Ok(tool_call) => {
                    Self::format_tool_call(&request.id, &tool_call.name, &tool_call.arguments)
                }
                // if the llm generates an invalid tool call, we still have to include it
                // in the history. It always comes with a response indicating the error
                Err(_) => Self::format_tool_call(&request.id, "invalid name", &json!({})),
            },
            AgentEvent::ToolResponse(response) => match response.tool_result {
                Ok(result) => Self::format_tool_response(&response.id, &result),
                Err(err) => {
                    Self::format_tool_response(&response.id, &json!(format!("Error: {}", err)))
                }
            },
            AgentEvent::StepFinish {
                reason,
                usage,
                is_continued,
            } => Self::format_step_finish(reason, &usage, is_continued),
            AgentEvent::Finish { reason, usage } => Self::format_finish(reason, &usage),
        };
        Some(encoded)
    }

    /// The closing parts sent when the reply fails after streaming started
    fn encode_failure(protocol: StreamProtocol) -> Vec<String> {
        match protocol {
            StreamProtocol::Data => vec![
                Self::format_error(STREAM_ERROR),
                Self::format_finish(FinishReason::Error, &Usage::default()),
            ],
            StreamProtocol::Text => vec![],
        }
    }
}

async fn handler(State(state): State<AppState>, body: Bytes) -> Result<StreamResponse, ChatError> {
    let request: ChatRequest = serde_json::from_slice(&body)?;

    // Convert incoming messages
    let messages = convert_messages(&request.messages);
    info!(messages = messages.len(), "Chat request");

    // Create channel for streaming
    let (tx, rx) = mpsc::channel(100);
    let stream = ReceiverStream::new(rx);

    let agent = state.agent.clone();
    let protocol = state.protocol;

    // Spawn task to handle streaming
    tokio::spawn(async move {
        let mut stream = agent.reply(&messages);

        loop {
            match timeout(Duration::from_millis(500), stream.next()).await {
                Ok(Some(Ok(event))) => {
                    let Some(chunk) = ProtocolFormatter::encode(protocol, event) else {
                        continue;
                    };
                    if tx.send(chunk).await.is_err() {
                        debug!("Client disconnected, stopping reply");
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    error!("Error processing reply: {}", e);
                    for chunk in ProtocolFormatter::encode_failure(protocol) {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                Ok(None) => {
                    break;
                }
                Err(_) => {
                    // Heartbeat, used to detect disconnected clients
                    if tx.is_closed() {
                        debug!("Client disconnected, stopping reply");
                        break;
                    }
                    continue;
                }
            }
        }
    });

    Ok(StreamResponse::new(stream, protocol))
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handler).fallback(method_not_allowed))
        .with_state(state)
}
