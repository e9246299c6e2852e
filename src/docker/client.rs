use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{config, config::Config, errors::GatewayError};

/// How long a built engine client is reused before it is torn down and
/// rebuilt (and the finder script consulted again).
const CLIENT_TTL: Duration = Duration::from_secs(600);

const ENGINE_TIMEOUT_SECS: u64 = 120;

struct CachedEngine {
    docker: Docker,
    host: String,
    built_at: Instant,
}

/// Shared, lazily-built handle to the container engine. Concurrent callers
/// go through the mutex and reuse a single client instance.
pub struct EngineHandle {
    config: Arc<Config>,
    cached: Mutex<Option<CachedEngine>>,
}

impl EngineHandle {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    /// Returns the engine client and the host published container ports are
    /// reachable on.
    pub async fn get(&self) -> Result<(Docker, String), GatewayError> {
        let mut guard = self.cached.lock().await;

        if let Some(cached) = guard.as_ref() {
            if cached.built_at.elapsed() < CLIENT_TTL {
                return Ok((cached.docker.clone(), cached.host.clone()));
            }
        }

        // Drop any expired client before building its replacement.
        *guard = None;

        let (docker, host) = self
            .build()
            .await
            .map_err(GatewayError::EngineUnavailable)?;
        info!(host = %host, "engine client built");

        *guard = Some(CachedEngine {
            docker: docker.clone(),
            host: host.clone(),
            built_at: Instant::now(),
        });
        Ok((docker, host))
    }

    async fn build(&self) -> Result<(Docker, String), anyhow::Error> {
        let mut cert: Option<PathBuf> = self.config.docker_cert.clone();
        let mut addr = self.config.docker_addr.clone();
        let mut host = self.config.docker_host.clone();

        if let Some(finder) = &self.config.trigger_finder {
            let overrides = run_finder(&self.config.trigger_bash, finder).await?;
            if let Some(value) = overrides.get("docker_cert") {
                cert = Some(PathBuf::from(value));
            }
            if let Some(value) = overrides.get("docker_addr") {
                addr = value.clone();
            }
            if let Some(value) = overrides.get("docker_host") {
                host = value.clone();
            }
            debug!(addr = %addr, host = %host, "finder overrides applied");
        }

        let docker = connect(&addr, cert.as_deref())?;
        Ok((docker, host))
    }
}

async fn run_finder(
    shell: &str,
    script: &Path,
) -> Result<std::collections::HashMap<String, String>, anyhow::Error> {
    let output = Command::new(shell)
        .arg(script)
        .output()
        .await
        .with_context(|| format!("could not run finder script {}", script.display()))?;

    if !output.status.success() {
        return Err(anyhow!(
            "finder script {} exited with {}",
            script.display(),
            output.status
        ));
    }

    Ok(config::parse_properties(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

/// Based on the provided endpoint, returns the correct engine client. A cert
/// directory turns tcp endpoints into mutually-authenticated TLS connections.
fn connect(addr: &str, cert_dir: Option<&Path>) -> Result<Docker, anyhow::Error> {
    if addr.starts_with("unix://") {
        return Docker::connect_with_unix(addr, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| anyhow!("could not connect to the engine at {addr}: {e}"));
    }

    if let Some(dir) = cert_dir {
        return Docker::connect_with_ssl(
            addr,
            &dir.join("key.pem"),
            &dir.join("cert.pem"),
            &dir.join("ca.pem"),
            ENGINE_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| anyhow!("could not build TLS engine client for {addr}: {e}"));
    }

    if addr.starts_with("tcp://") || addr.starts_with("http") {
        return Docker::connect_with_http(addr, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| anyhow!("could not connect to the engine at {addr}: {e}"));
    }

    Docker::connect_with_local_defaults()
        .map_err(|e| anyhow!("could not connect to the local engine: {e}"))
}
