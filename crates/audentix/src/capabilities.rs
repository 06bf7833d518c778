use async_trait::async_trait;
use serde_json::Value;

use crate::errors::AgentResult;
use crate::models::tool::Tool;

pub mod contact_form;

pub use contact_form::ContactFormCapability;

/// A named, schema-typed function the model may choose to invoke mid-response.
///
/// The agent advertises every registered capability to the provider as a tool
/// and routes tool requests back to the capability whose name matches.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The tool name the model uses to invoke this capability
    fn name(&self) -> &str;

    /// A description the model uses to decide when to invoke it
    fn description(&self) -> &str;

    /// JSON Schema of the arguments
    fn input_schema(&self) -> &Value;

    /// Run the capability with the model-supplied arguments.
    ///
    /// Failures the model should explain to the user belong in the returned
    /// value; an `Err` means the call itself was unusable.
    async fn execute(&self, arguments: Value) -> AgentResult<Value>;

    fn tool(&self) -> Tool {
        Tool::new(self.name(), self.description(), self.input_schema().clone())
    }
}
