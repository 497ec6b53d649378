//! # edlink-monitor
//!
//! Connects to the ED realtime channel as one user and logs what arrives:
//! notifications, list/prescription/patient updates and server stats.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use edlink_client::{
    AuthToken, ClientConfig, ConnectionState, MemoryIdentity, NotificationItem, RealtimeManager,
    TopicBus, UserIdentity,
};
use edlink_core::logging::{LogFormat, init_subscriber};
use edlink_settings::EdlinkSettings;
use tracing::{info, warn};

/// ED realtime channel monitor.
#[derive(Parser, Debug)]
#[command(name = "edlink-monitor", about = "Monitor the ED realtime channel")]
struct Cli {
    /// User to connect as.
    #[arg(long)]
    user_id: String,

    /// Auth token.
    #[arg(long, env = "EDLINK_TOKEN", hide_env_values = true)]
    token: String,

    /// Role (defaults to the configured default role).
    #[arg(long)]
    role: Option<String>,

    /// Area (defaults to the configured default area).
    #[arg(long)]
    area: Option<String>,

    /// Server host (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Connect with `wss://`.
    #[arg(long)]
    secure: bool,

    /// Settings file (defaults to `~/.edlink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut EdlinkSettings) {
        let realtime = &mut settings.realtime;
        if let Some(host) = &self.host {
            realtime.host.clone_from(host);
        }
        if let Some(port) = self.port {
            realtime.port = port;
        }
        if self.secure {
            realtime.secure = true;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }

    fn identity(&self) -> MemoryIdentity {
        let mut user = UserIdentity::new(self.user_id.clone());
        if let Some(role) = &self.role {
            user = user.with_role(role.clone());
        }
        if let Some(area) = &self.area {
            user = user.with_area(area.clone());
        }
        MemoryIdentity::new(user, AuthToken::new(self.token.clone()))
    }
}

fn log_notification(item: &NotificationItem) {
    info!(
        id = %item.id,
        kind = %item.kind,
        priority = item.priority.as_str(),
        message = %item.message,
        "notification"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli
        .settings
        .clone()
        .unwrap_or_else(edlink_settings::settings_path);
    let mut settings = edlink_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid command-line overrides")?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    if !TopicBus::init_global(settings.realtime.topic_bus_capacity) {
        warn!("topic bus already in use, configured capacity not applied");
    }
    let mut topics = TopicBus::global().subscribe_all();
    let manager = RealtimeManager::builder(
        ClientConfig::from(&settings.realtime),
        Arc::new(cli.identity()),
    )
    .notifier(Arc::new(log_notification))
    .start();
    let mut states = manager.watch_state();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            Some(event) = topics.recv() => {
                info!(topic = %event.topic, payload = %event.payload, "topic event");
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                if *states.borrow_and_update() == ConnectionState::GivenUp {
                    warn!("server unreachable; press ctrl-c to exit");
                }
            }
        }
    }

    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}
