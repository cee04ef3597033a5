use std::sync::Arc;

use magpie::config::ClientConfig;
use magpie::{ImsClient, IncomingSessionListener, RegistrationListener};
use magpie::domain::session::Session;
use tracing::{info, warn, Level};
use tracing_subscriber;

struct LogRegistrationListener;

impl RegistrationListener for LogRegistrationListener {
    fn on_registered(&self) {
        info!("Registered with the IMS network");
    }

    fn on_registration_failed(&self, reason: &str) {
        warn!("Registration failed: {}", reason);
    }

    fn on_unregistered(&self) {
        info!("Unregistered");
    }
}

struct AutoAcceptListener;

impl IncomingSessionListener for AutoAcceptListener {
    fn on_incoming_session(&self, session: Arc<Session>) {
        info!("Accepting incoming {:?} session", session.kind());
        session.accept();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Magpie IMS client");

    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "magpie.toml".to_string());
    let config = ClientConfig::load(&config_path)?;
    info!("Configuration loaded for {}", config.ims.public_user_id);

    let client = ImsClient::start(config).await?;
    client.add_registration_listener(Arc::new(LogRegistrationListener));
    client.add_incoming_session_listener(Arc::new(AutoAcceptListener));

    if !client.register().await {
        anyhow::bail!("initial registration failed");
    }

    info!("Client running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    client.shutdown().await;

    Ok(())
}
