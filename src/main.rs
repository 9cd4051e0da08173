//! Narthex: a name-based multi-tenant TLS+HTTP front door.
//!
//! This is the application entry point. It initializes tracing, loads
//! configuration from a TOML file, registers the configured certificate
//! domains, starts the front door listeners, and runs until interrupted.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use narthex::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use narthex::{Dispatcher, DomainRegistry, EventBus, Registration, Server, ServerEvent};

/// Narthex: a name-based multi-tenant TLS+HTTP front door
#[derive(Parser, Debug)]
#[command(name = "narthex", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "narthex=debug")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    // Load configuration
    let config = AppConfig::load(&args.config)?;

    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Loaded configuration");

    let events = EventBus::new();
    let domains = DomainRegistry::new(events.clone());
    let dispatcher = Dispatcher::new(domains.clone());

    // Register configured domains; certificate loads run in the background
    // and report on the event bus.
    for entry in &config.domain {
        match (&entry.alias, &entry.key, &entry.cert) {
            (Some(alias), _, _) => {
                tracing::info!(domain = %entry.domain, %alias, "Domain configured (alias)");
                domains.register(&entry.domain, Registration::Alias(alias.clone()));
            }
            (None, Some(key), Some(cert)) => {
                tracing::info!(domain = %entry.domain, %cert, "Domain configured");
                domains.register(
                    &entry.domain,
                    Registration::Files {
                        key_path: key.clone(),
                        cert_path: cert.clone(),
                    },
                );
            }
            // AppConfig::load validated each entry already.
            _ => unreachable!("config validation admits exactly one registration form"),
        }
    }

    // Log process-wide notifications.
    let mut notifications = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = notifications.recv().await {
            match event {
                ServerEvent::Registered { domain, .. } => {
                    tracing::info!(%domain, "Certificate registered");
                }
                ServerEvent::CertificateError { domain, reason } => {
                    tracing::warn!(%domain, %reason, "Certificate registration failed");
                }
                ServerEvent::Error(message) => {
                    tracing::error!(%message, "Server error");
                }
            }
        }
    });

    let server = Server::new(config.server.clone(), domains, dispatcher, events);
    server.start().await?;

    // Run until interrupted.
    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    server.stop();

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
