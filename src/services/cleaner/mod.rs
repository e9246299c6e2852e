use anyhow::anyhow;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions,
};
use bollard::image::PruneImagesOptions;
use bollard::network::PruneNetworksOptions;
use bollard::Docker;
use regex::Regex;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::config::PruneKind;
use crate::errors::GatewayError;

/// Decides whether a container may be force-removed: its name must not hit
/// any exclusion pattern and it must have been started at least
/// `delay_minutes` ago.
pub(crate) fn should_clear(
    name: &str,
    started_at: OffsetDateTime,
    now: OffsetDateTime,
    delay_minutes: u64,
    exclusions: &[Regex],
) -> bool {
    if exclusions.iter().any(|pattern| pattern.is_match(name)) {
        return false;
    }
    now - started_at >= Duration::minutes(delay_minutes as i64)
}

/// Force-removes every container old enough and not excluded, returning how
/// many went. The first engine error aborts the pass.
pub async fn clear(
    docker: &Docker,
    delay_minutes: u64,
    exclusions: &[Regex],
) -> Result<usize, GatewayError> {
    let summaries = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await
        .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;

    let now = OffsetDateTime::now_utc();
    let mut removed = 0;

    for summary in summaries {
        let Some(id) = summary.id else { continue };

        let inspected = docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;

        let name = inspected.name.clone().unwrap_or_default();
        let Some(started_at) = inspected
            .state
            .as_ref()
            .and_then(|state| state.started_at.as_deref())
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        else {
            debug!(container = %name, "no parsable start time, skipping");
            continue;
        };

        if !should_clear(&name, started_at, now, delay_minutes, exclusions) {
            continue;
        }

        docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;

        info!(container = %name, id = %id, "container cleared");
        removed += 1;
    }

    Ok(removed)
}

/// Prunes unused networks, images and containers, in that order, skipping
/// excluded families. The first engine error aborts the pass.
pub async fn prune(docker: &Docker, exclusions: &[PruneKind]) -> Result<(), GatewayError> {
    if !exclusions.contains(&PruneKind::Network) {
        docker
            .prune_networks(None::<PruneNetworksOptions<String>>)
            .await
            .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;
        debug!("networks pruned");
    }

    if !exclusions.contains(&PruneKind::Image) {
        docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;
        debug!("images pruned");
    }

    if !exclusions.contains(&PruneKind::Container) {
        docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .map_err(|err| GatewayError::Housekeeper(anyhow!(err)))?;
        debug!("containers pruned");
    }

    Ok(())
}
