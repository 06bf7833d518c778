use audentix::agent::Agent;
use std::sync::Arc;

use crate::configuration::StreamProtocol;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub protocol: StreamProtocol,
}
