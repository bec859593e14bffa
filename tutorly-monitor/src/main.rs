//! Tutorly Monitor: follows a real-time notification endpoint and logs
//! every envelope it receives.
//!
//! Run with `RUST_LOG=info` (or `debug` for state-machine detail).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use tutorly_realtime::{ClientConfig, ConnectionState, RealtimeClient};

/// Tutorly real-time monitor.
#[derive(Parser, Debug)]
#[command(name = "tutorly-monitor", about = "Log Tutorly real-time notifications")]
struct Cli {
    /// Endpoint, e.g. `wss://api.tutorly.app/ws/notifications/`.
    #[arg(long)]
    url: Option<String>,

    /// Bearer token sent as a query parameter.
    #[arg(long, env = "TUTORLY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// JSON client config; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    base_delay_ms: Option<u64>,

    /// Only log these message types (repeatable).
    #[arg(long = "type", value_name = "MESSAGE_TYPE")]
    types: Vec<String>,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
                ClientConfig::from_json_str(&raw).map_err(|e| e.to_string())?
            }
            None => match &self.url {
                Some(url) => ClientConfig::new(url.clone()),
                None => return Err("either --url or --config is required".to_string()),
            },
        };
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(max_attempts) = self.max_attempts {
            config.reconnect.max_attempts = max_attempts;
        }
        if let Some(base_delay_ms) = self.base_delay_ms {
            config.reconnect.base_delay_ms = base_delay_ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match cli.client_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let client = match RealtimeClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let log_envelope = |env: &tutorly_realtime::MessageEnvelope| {
        let data = serde_json::to_string(&env.data).unwrap_or_default();
        match env.user_id {
            Some(user) => info!("[{}] user={user} {data}", env.message_type),
            None => info!("[{}] {data}", env.message_type),
        }
    };
    if cli.types.is_empty() {
        client.subscribe_all(log_envelope);
    } else {
        for message_type in &cli.types {
            client.subscribe_envelopes(message_type.as_str(), log_envelope);
        }
    }
    client.on_error(|e| error!("{e}"));

    let mut states = client.watch_state();
    info!("Starting Tutorly Monitor...");
    client.connect();

    let outcome = loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                let state = *states.borrow_and_update();
                info!("Connection {state}");
                match state {
                    ConnectionState::Failed => break ExitCode::FAILURE,
                    ConnectionState::Closed => break ExitCode::SUCCESS,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break ExitCode::SUCCESS;
            }
        }
    };

    client.dispose();
    outcome
}
