use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::crate_version;
use tracing_subscriber::EnvFilter;

mod config;
mod docker;
mod errors;
mod proxy_server;
mod services;
mod stores;
mod tools;

/// Shared handles every component works against: the loaded configuration,
/// the cached engine client and the process-wide upstream HTTP client.
pub struct Gateway {
    pub config: Arc<config::Config>,
    pub engine: docker::client::EngineHandle,
    pub http_client: hyper::Client<hyper::client::HttpConnector>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Loads configuration from command-line, YAML or environment sources
    let config = Arc::new(config::load("/etc/pdgate")?);

    // Creates a tracing/logging subscriber based on the configuration provided
    let (level, json) = config.log_settings();
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_max_level(&level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(EnvFilter::from_default_env())
            .with_max_level(&level)
            .init();
    }

    let gateway = Arc::new(Gateway {
        engine: docker::client::EngineHandle::new(config.clone()),
        http_client: hyper::Client::new(),
        config,
    });

    tracing::info!(
        version = crate_version!(),
        listen = %gateway.config.listen,
        refresh_ms = gateway.config.refresh_time,
        "starting pdgate"
    );

    // The scheduler stops cooperatively; the flag stays down for the whole
    // process lifetime here.
    let stop = Arc::new(AtomicBool::new(false));
    let _scheduler = services::spawn_service(services::Scheduler::new(gateway.clone(), stop));

    proxy_server::run(gateway).await
}
