use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::docker::discovery::{Container, ForwardKind};
use crate::Gateway;

use self::refresh::RefreshOutcome;

pub mod cleaner;
pub mod forwarder;
pub mod refresh;

/// A long-running gateway task. Spawned once at startup and expected to run
/// until the process exits (or its stop flag is raised).
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;
    async fn start(&mut self);
}

pub fn spawn_service(mut service: impl Service + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(service = service.name(), "service started");
        service.start().await;
        info!(service = service.name(), "service stopped");
    })
}

/// Drives the periodic work: reconciliation with trigger scripts on every
/// tick, the clear and prune passes on their own cadences.
pub struct Scheduler {
    gateway: Arc<Gateway>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(gateway: Arc<Gateway>, stop: Arc<AtomicBool>) -> Self {
        Self { gateway, stop }
    }
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn start(&mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.gateway.config.refresh_time));
        interval.tick().await;

        let mut clear_last = Instant::now();
        let mut prune_last = Instant::now();

        loop {
            interval.tick().await;
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            run_phase("refresh", refresh_phase(self.gateway.clone())).await;

            let config = &self.gateway.config;
            if config.docker_clear_delay > 0
                && clear_last.elapsed() >= Duration::from_secs(config.docker_clear_delay * 60)
            {
                clear_last = Instant::now();
                run_phase("clear", clear_phase(self.gateway.clone())).await;
            }

            if config.docker_prune_delay > 0
                && prune_last.elapsed() >= Duration::from_secs(config.docker_prune_delay * 60)
            {
                prune_last = Instant::now();
                run_phase("prune", prune_phase(self.gateway.clone())).await;
            }
        }
    }
}

/// Runs one scheduler phase in its own task so a panic inside it is logged
/// here instead of taking the scheduler down.
async fn run_phase<F>(name: &'static str, phase: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(err) = tokio::spawn(phase).await {
        error!(phase = name, error = %err, "phase aborted");
    }
}

async fn refresh_phase(gateway: Arc<Gateway>) {
    match refresh::refresh(&gateway).await {
        Ok(outcome) => {
            if !outcome.is_unchanged() {
                info!(
                    added = outcome.added.len(),
                    updated = outcome.updated.len(),
                    removed = outcome.removed.len(),
                    "proxy set changed"
                );
                fire_triggers(&gateway, &outcome).await;
            }
        }
        Err(err) => warn!(error = %err, "refresh failed"),
    }
}

async fn clear_phase(gateway: Arc<Gateway>) {
    let exclusions: Vec<Regex> = gateway
        .config
        .docker_clear_exc
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect();

    let (docker, _) = match gateway.engine.get().await {
        Ok(engine) => engine,
        Err(err) => {
            warn!(error = %err, "engine unavailable for clear pass");
            return;
        }
    };

    match cleaner::clear(&docker, gateway.config.docker_clear_delay, &exclusions).await {
        Ok(removed) => info!(removed, "clear pass finished"),
        Err(err) => warn!(error = %err, "clear pass failed"),
    }
}

async fn prune_phase(gateway: Arc<Gateway>) {
    let (docker, _) = match gateway.engine.get().await {
        Ok(engine) => engine,
        Err(err) => {
            warn!(error = %err, "engine unavailable for prune pass");
            return;
        }
    };

    match cleaner::prune(&docker, &gateway.config.docker_prune_exc).await {
        Ok(()) => info!("prune pass finished"),
        Err(err) => warn!(error = %err, "prune pass failed"),
    }
}

/// Invokes the configured trigger script once per affected HTTP virtual
/// host. Stream forwards never fire triggers; failures are logged and never
/// propagate.
async fn fire_triggers(gateway: &Gateway, outcome: &RefreshOutcome) {
    let config = &gateway.config;
    run_trigger_bucket(gateway, &outcome.added, &outcome.all, config.trigger_added.as_deref()).await;
    run_trigger_bucket(
        gateway,
        &outcome.updated,
        &outcome.all,
        config.trigger_updated.as_deref(),
    )
    .await;
    run_trigger_bucket(
        gateway,
        &outcome.removed,
        &outcome.dropped,
        config.trigger_removed.as_deref(),
    )
    .await;
}

async fn run_trigger_bucket(
    gateway: &Gateway,
    prefixes: &[String],
    source: &HashMap<String, Container>,
    script: Option<&Path>,
) {
    let Some(script) = script else { return };

    for prefix in prefixes {
        let Some(container) = source.get(prefix) else {
            continue;
        };
        let Some(forward) = container.forwards.get(prefix) else {
            continue;
        };
        if forward.kind != ForwardKind::Http {
            continue;
        }

        let mut host = format!("{}{}", forward.prefix, gateway.config.host_suffix);
        let mut pref = forward.prefix.clone();
        if forward.wildcard {
            host = format!("*.{host}");
            pref = format!("*.{pref}");
        }

        let status = Command::new(&gateway.config.trigger_bash)
            .arg(script)
            .env("PD_SERVICE_NAME", &container.name)
            .env("PD_SERVICE_VER", &container.version)
            .env("PD_SERVICE_TYPE", forward.kind.as_str())
            .env("PD_SERVICE_HOST", &host)
            .env("PD_SERVICE_PREF", &pref)
            .status()
            .await;

        match status {
            Ok(code) if code.success() => {
                debug!(prefix = %prefix, script = %script.display(), "trigger finished");
            }
            Ok(code) => {
                warn!(prefix = %prefix, script = %script.display(), status = %code, "trigger exited with failure");
            }
            Err(err) => {
                warn!(prefix = %prefix, script = %script.display(), error = %err, "could not run trigger");
            }
        }
    }
}
