use std::collections::HashMap;

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::PortMap;
use bollard::Docker;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{GatewayError, LabelError};

/// Marker that splits a container name into service name and version
/// (`web-srv-v1.2` -> service `web`, version `v1.2`).
pub const MATCH_KEY: &str = "-srv-";

pub const TOKEN_LABEL: &str = "PD_SERVICE_TOKEN";
const HOST_LABEL_PREFIX: &str = "PD_HOST_";
const TCP_LABEL_PREFIX: &str = "PD_TCP_";
const UDP_LABEL_PREFIX: &str = "PD_UDP_";

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^.*{MATCH_KEY}v[0-9\\.]*.*$")).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Http,
    Tcp,
    Udp,
}

impl ForwardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardKind::Http => "http",
            ForwardKind::Tcp => "tcp",
            ForwardKind::Udp => "udp",
        }
    }
}

impl std::fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single externally-reachable endpoint declared by one container label.
/// Immutable once constructed; a changed published port produces a fresh
/// `Forward` under the same prefix with a different `uri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Label suffix (`api` for `PD_HOST_api`).
    pub name: String,
    pub kind: ForwardKind,
    /// Host-key for http forwards, bind address for tcp/udp forwards.
    pub key: String,
    /// Canonical identity of the forward across the whole gateway.
    pub prefix: String,
    /// `engine_host:published_port` the forward dials.
    pub uri: String,
    /// Http only: the virtual host also matches any suffix of it.
    pub wildcard: bool,
}

/// A discovered running workload: service name, version, control token and
/// its declared forwards, keyed by prefix. Produced fresh on every discovery
/// pass and replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub version: String,
    pub token: String,
    pub status: String,
    pub created: i64,
    pub forwards: HashMap<String, Forward>,
}

/// Computes the canonical prefix of an http forward: the host-key glued to
/// the version (dots removed), a dot, then the service name.
pub fn http_prefix(host_key: &str, version: &str, name: &str) -> String {
    let version = version.replace('.', "");
    if host_key.is_empty() {
        format!("{version}.{name}")
    } else {
        format!("{host_key}{version}.{name}")
    }
}

/// Splits an engine-reported container name on the match marker. The leading
/// `/` the engine adds is stripped; the version runs up to the first `-`
/// after the marker.
pub(crate) fn split_service_name(raw: &str) -> Option<(String, String)> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let (name, rest) = trimmed.split_once(MATCH_KEY)?;
    if name.is_empty() || rest.is_empty() {
        return None;
    }
    let version = rest.split_once('-').map_or(rest, |(v, _)| v);
    Some((name.to_string(), version.to_string()))
}

/// Parses a `PD_HOST_*` value: `[hostKey "/"] ":" port`. A leading `*` on the
/// host-key marks the forward as wildcard.
pub(crate) fn parse_host_label(value: &str) -> Result<(String, bool, u16), LabelError> {
    let (host_part, port_part) = match value.split_once('/') {
        Some((host, port)) => (host, port),
        None => ("", value),
    };
    let port = port_part
        .strip_prefix(':')
        .ok_or(LabelError::MissingPort)?
        .parse::<u16>()
        .map_err(|_| LabelError::BadPort)?;

    match host_part.strip_prefix('*') {
        Some(rest) => Ok((rest.to_string(), true, port)),
        None => Ok((host_part.to_string(), false, port)),
    }
}

/// Parses a `PD_TCP_*` / `PD_UDP_*` value: `bindAddr "/" ":"? port`.
pub(crate) fn parse_stream_label(value: &str) -> Result<(String, u16), LabelError> {
    let (bind, port_part) = value.split_once('/').ok_or(LabelError::MissingBind)?;
    if bind.is_empty() {
        return Err(LabelError::MissingBind);
    }
    let port = port_part
        .strip_prefix(':')
        .unwrap_or(port_part)
        .parse::<u16>()
        .map_err(|_| LabelError::BadPort)?;
    Ok((bind.to_string(), port))
}

/// Resolves a declared internal port to the first published host port in the
/// inspected port map. Udp forwards look under `/udp` first so both
/// publication styles resolve.
pub(crate) fn resolve_host_port(
    ports: Option<&PortMap>,
    internal: u16,
    kind: ForwardKind,
) -> Result<String, LabelError> {
    let ports = ports.ok_or(LabelError::UnpublishedPort(internal))?;

    let mut candidates = vec![format!("{internal}/tcp")];
    if kind == ForwardKind::Udp {
        candidates.insert(0, format!("{internal}/udp"));
    }

    for key in candidates {
        if let Some(Some(bindings)) = ports.get(&key) {
            if let Some(port) = bindings.iter().find_map(|b| b.host_port.clone()) {
                return Ok(port);
            }
        }
    }
    Err(LabelError::UnpublishedPort(internal))
}

/// Walks a container's labels into its control token and forwards. A bad
/// label is logged and skipped; it never poisons its siblings.
pub(crate) fn parse_labels(
    labels: &HashMap<String, String>,
    ports: Option<&PortMap>,
    name: &str,
    version: &str,
    engine_host: &str,
) -> (String, HashMap<String, Forward>) {
    let mut token = String::new();
    let mut forwards = HashMap::new();

    for (label, value) in labels {
        if label == TOKEN_LABEL {
            token = value.clone();
            continue;
        }

        let parsed = if let Some(suffix) = label.strip_prefix(HOST_LABEL_PREFIX) {
            parse_host_forward(suffix, value, ports, name, version, engine_host)
        } else if let Some(suffix) = label.strip_prefix(TCP_LABEL_PREFIX) {
            parse_stream_forward(suffix, value, ports, ForwardKind::Tcp, engine_host)
        } else if let Some(suffix) = label.strip_prefix(UDP_LABEL_PREFIX) {
            parse_stream_forward(suffix, value, ports, ForwardKind::Udp, engine_host)
        } else {
            continue;
        };

        match parsed {
            Ok(forward) => {
                debug!(prefix = %forward.prefix, uri = %forward.uri, "forward declared");
                forwards.insert(forward.prefix.clone(), forward);
            }
            Err(err) => {
                warn!(service = name, label = %label, value = %value, error = %err, "skipping label");
            }
        }
    }

    (token, forwards)
}

fn parse_host_forward(
    label_name: &str,
    value: &str,
    ports: Option<&PortMap>,
    name: &str,
    version: &str,
    engine_host: &str,
) -> Result<Forward, LabelError> {
    let (host_key, wildcard, internal) = parse_host_label(value)?;
    let published = resolve_host_port(ports, internal, ForwardKind::Http)?;
    Ok(Forward {
        name: label_name.to_string(),
        kind: ForwardKind::Http,
        prefix: http_prefix(&host_key, version, name),
        key: host_key,
        uri: format!("{engine_host}:{published}"),
        wildcard,
    })
}

fn parse_stream_forward(
    label_name: &str,
    value: &str,
    ports: Option<&PortMap>,
    kind: ForwardKind,
    engine_host: &str,
) -> Result<Forward, LabelError> {
    let (bind, internal) = parse_stream_label(value)?;
    let published = resolve_host_port(ports, internal, kind)?;
    Ok(Forward {
        name: label_name.to_string(),
        kind,
        prefix: format!("{kind}://{bind}"),
        key: bind,
        uri: format!("{engine_host}:{published}"),
        wildcard: false,
    })
}

/// Lists and inspects running service containers, returning the mapping from
/// forward prefix to its owning container snapshot. A listing or inspection
/// failure aborts the whole pass.
pub async fn discover(
    docker: &Docker,
    engine_host: &str,
) -> Result<HashMap<String, Container>, GatewayError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![MATCH_KEY.to_string()]);

    let summaries = docker
        .list_containers(Some(ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        }))
        .await
        .map_err(GatewayError::DiscoveryFailed)?;

    let mut discovered = HashMap::new();

    for summary in summaries {
        let Some(id) = summary.id else { continue };
        let listed_name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .cloned()
            .unwrap_or_default();

        if !SERVICE_NAME.is_match(&listed_name) {
            continue;
        }

        let inspected = docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
            .map_err(GatewayError::DiscoveryFailed)?;

        let running = inspected
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            debug!(container = %listed_name, "skipping non-running container");
            continue;
        }

        let raw_name = inspected.name.as_deref().unwrap_or(&listed_name);
        let Some((name, version)) = split_service_name(raw_name) else {
            continue;
        };

        let labels = inspected
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        let ports = inspected
            .network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref());

        let (token, forwards) = parse_labels(&labels, ports, &name, &version, engine_host);

        let container = Container {
            id,
            name,
            version,
            token,
            status: summary.status.unwrap_or_default(),
            created: summary.created.unwrap_or_default(),
            forwards,
        };

        for prefix in container.forwards.keys() {
            discovered.insert(prefix.clone(), container.clone());
        }
    }

    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use bollard::models::PortBinding;

    use super::*;

    fn port_map(entries: &[(&str, &str)]) -> PortMap {
        entries
            .iter()
            .map(|(key, host_port)| {
                (
                    (*key).to_string(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some((*host_port).to_string()),
                    }]),
                )
            })
            .collect()
    }

    #[test]
    fn test_split_service_name() {
        assert_eq!(
            split_service_name("/web-srv-v1.2"),
            Some(("web".to_string(), "v1.2".to_string()))
        );
        assert_eq!(
            split_service_name("/web-srv-v1.2-canary"),
            Some(("web".to_string(), "v1.2".to_string()))
        );
        assert_eq!(split_service_name("/plain-container"), None);
    }

    #[test]
    fn test_http_prefix_formats() {
        assert_eq!(http_prefix("api", "v1.2", "web"), "apiv12.web");
        assert_eq!(http_prefix("", "v1.2", "web"), "v12.web");
    }

    #[test]
    fn test_parse_host_label() {
        assert_eq!(
            parse_host_label("*api/:8080"),
            Ok(("api".to_string(), true, 8080))
        );
        assert_eq!(
            parse_host_label("api/:8080"),
            Ok(("api".to_string(), false, 8080))
        );
        assert_eq!(parse_host_label(":8080"), Ok((String::new(), false, 8080)));
        assert_eq!(parse_host_label("api/8080"), Err(LabelError::MissingPort));
        assert_eq!(parse_host_label(":eighty"), Err(LabelError::BadPort));
    }

    #[test]
    fn test_parse_stream_label() {
        assert_eq!(
            parse_stream_label("127.0.0.1:5432/:5432"),
            Ok(("127.0.0.1:5432".to_string(), 5432))
        );
        assert_eq!(
            parse_stream_label("127.0.0.1:5432/5432"),
            Ok(("127.0.0.1:5432".to_string(), 5432))
        );
        assert_eq!(parse_stream_label(":5432"), Err(LabelError::MissingBind));
    }

    #[test]
    fn test_wildcard_host_forward() {
        let labels = HashMap::from([
            ("PD_HOST_api".to_string(), "*api/:8080".to_string()),
            ("PD_SERVICE_TOKEN".to_string(), "secret".to_string()),
        ]);
        let ports = port_map(&[("8080/tcp", "32001")]);

        let (token, forwards) = parse_labels(&labels, Some(&ports), "web", "v1.2", "10.0.0.5");

        assert_eq!(token, "secret");
        let forward = forwards.get("apiv12.web").expect("forward exists");
        assert_eq!(forward.kind, ForwardKind::Http);
        assert_eq!(forward.uri, "10.0.0.5:32001");
        assert_eq!(forward.key, "api");
        assert!(forward.wildcard);
    }

    #[test]
    fn test_unpublished_port_is_skipped() {
        let labels = HashMap::from([
            ("PD_HOST_api".to_string(), ":9999".to_string()),
            ("PD_TCP_db".to_string(), "127.0.0.1:5432/:5432".to_string()),
        ]);
        let ports = port_map(&[("5432/tcp", "32002")]);

        let (_, forwards) = parse_labels(&labels, Some(&ports), "web", "v1.2", "10.0.0.5");

        // the unresolvable http label is dropped, the tcp one still parses
        assert_eq!(forwards.len(), 1);
        let forward = forwards.get("tcp://127.0.0.1:5432").expect("tcp forward");
        assert_eq!(forward.kind, ForwardKind::Tcp);
        assert_eq!(forward.uri, "10.0.0.5:32002");
    }

    #[test]
    fn test_udp_port_resolution_prefers_udp() {
        let ports = port_map(&[("53/udp", "31053"), ("53/tcp", "31054")]);
        assert_eq!(
            resolve_host_port(Some(&ports), 53, ForwardKind::Udp),
            Ok("31053".to_string())
        );
        assert_eq!(
            resolve_host_port(Some(&ports), 53, ForwardKind::Tcp),
            Ok("31054".to_string())
        );
        assert_eq!(
            resolve_host_port(Some(&ports), 54, ForwardKind::Udp),
            Err(LabelError::UnpublishedPort(54))
        );
    }
}
