mod configuration;
mod error;
mod routes;
mod state;

use audentix::{
    agent::Agent,
    capabilities::{Capability, ContactFormCapability},
    prompt_template::CompanyProfile,
    providers::factory,
};
use dotenv::dotenv;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine, the environment may already be set
    dotenv().ok();

    // Initialize tracing for logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let settings = configuration::Settings::new()?;
    let addr = settings.server.socket_addr()?;

    let provider = factory::get_provider(settings.provider.into_config())?;

    if settings.email.credentials().is_none() {
        warn!("EmailJS is not configured, contact form submissions will report an error");
    }
    let company = CompanyProfile {
        email: settings.email.business_inbox.clone(),
        ..Default::default()
    };
    let contact_form: Arc<dyn Capability> = Arc::new(ContactFormCapability::new(settings.email)?);

    let agent = Agent::new(provider, vec![contact_form], &company)?
        .with_max_steps(settings.chat.max_steps);

    // Create app state
    let state = state::AppState {
        agent: Arc::new(agent),
        protocol: settings.chat.protocol,
    };

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    // Run server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
