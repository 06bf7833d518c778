//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - chat hook messages, sent from the website widget to the server
//! - data stream protocol parts, sent from the server back to the widget
//! - gemini and openai messages/tools, sent from the agent to the LLM
//! - capability arguments and results, exchanged with the capabilities
//!
//! We always immediately convert those data models into the internal structs
//! using to/from helpers, so the internal models are not an exact match to
//! any of these formats.
pub mod message;
pub mod role;
pub mod tool;
