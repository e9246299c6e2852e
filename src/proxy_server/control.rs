use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bollard::container::{
    ListContainersOptions, LogsOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures_util::{SinkExt, StreamExt};
use http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
    WWW_AUTHENTICATE,
};
use http::StatusCode;
use hyper::{Body, Request, Response};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::docker::discovery::{Container, MATCH_KEY};
use crate::Gateway;

const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug)]
pub enum ControlError {
    Unauthorized(&'static str),
    Engine(String),
}

impl ControlError {
    pub fn into_response(self) -> Response<Body> {
        match self {
            ControlError::Unauthorized(body) => Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(WWW_AUTHENTICATE, "Basic realm=\"pdgate\"")
                .body(Body::from(body))
                .unwrap_or_default(),
            ControlError::Engine(body) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from(body))
                .unwrap_or_default(),
        }
    }
}

/// Entry point for requests under the service prefix on a matched virtual
/// host. Every action requires Basic auth against the owning container's
/// name and token.
pub async fn handle(gateway: &Gateway, container: &Container, req: Request<Body>) -> Response<Body> {
    match dispatch(gateway, container, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn dispatch(
    gateway: &Gateway,
    container: &Container,
    req: Request<Body>,
) -> Result<Response<Body>, ControlError> {
    authorize(container, &req)?;

    let action = req
        .uri()
        .path()
        .strip_prefix(gateway.config.srv_prefix.as_str())
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string();

    let (docker, _) = gateway
        .engine
        .get()
        .await
        .map_err(|err| ControlError::Engine(err.to_string()))?;

    match action.as_str() {
        "docker/logs" => logs(docker, container, req).await,
        "docker/start" | "docker/stop" | "docker/restart" => {
            lifecycle(&action, docker, container, req).await
        }
        "docker/ps" => ps(docker, container).await,
        other => Err(ControlError::Engine(format!(
            "unknown control action {other:?}"
        ))),
    }
}

/// Basic auth where the username is the service name and the password is the
/// container's token label. A container without a token never authorizes.
fn authorize(container: &Container, req: &Request<Body>) -> Result<(), ControlError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ControlError::Unauthorized("unauthorized"))?;

    let (scheme, encoded) = header
        .split_once(' ')
        .ok_or(ControlError::Unauthorized("unauthorized"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(ControlError::Unauthorized("unauthorized"));
    }

    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| ControlError::Unauthorized("unauthorized"))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| ControlError::Unauthorized("unauthorized"))?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or(ControlError::Unauthorized("unauthorized"))?;

    if user != container.name {
        return Err(ControlError::Unauthorized("unauthorized"));
    }
    if container.token.is_empty() || password != container.token {
        return Err(ControlError::Unauthorized("invalid password"));
    }
    Ok(())
}

/// Merges query-string parameters with a form-encoded body, body values
/// winning, the way request forms behave.
async fn form_params(req: &mut Request<Body>) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = req
        .uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form {
        if let Ok(body) = hyper::body::to_bytes(req.body_mut()).await {
            for (key, value) in url::form_urlencoded::parse(&body).into_owned() {
                params.insert(key, value);
            }
        }
    }

    params
}

fn bool_flag(params: &HashMap<String, String>, name: &str, default: bool) -> bool {
    params
        .get(name)
        .map(|value| value == "1")
        .unwrap_or(default)
}

/// Builds the engine log options from request parameters. `stdout` and
/// `stderr` default on; the other switches are on only for a `1` value.
/// The `details` parameter is accepted but the engine client has no such
/// knob to forward it to.
fn logs_options(params: &HashMap<String, String>) -> LogsOptions<String> {
    LogsOptions {
        stdout: bool_flag(params, "stdout", true),
        stderr: bool_flag(params, "stderr", true),
        follow: bool_flag(params, "follow", false),
        timestamps: bool_flag(params, "timestamps", false),
        since: params
            .get("since")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        until: params
            .get("until")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        tail: params
            .get("tail")
            .cloned()
            .unwrap_or_else(|| "all".to_string()),
    }
}

/// Upgrades the request to a WebSocket and relays the engine's demultiplexed
/// log stream into it until either side closes.
async fn logs(
    docker: Docker,
    container: &Container,
    mut req: Request<Body>,
) -> Result<Response<Body>, ControlError> {
    let params = form_params(&mut req).await;
    let options = logs_options(&params);
    let target = params
        .get("id")
        .cloned()
        .unwrap_or_else(|| container.id.clone());

    let is_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|value| value.as_bytes().to_vec());

    let (true, Some(key)) = (is_upgrade, key) else {
        return Err(ControlError::Engine(
            "log streaming requires a websocket upgrade".to_string(),
        ));
    };
    let accept = derive_accept_key(&key);

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                stream_logs(ws, docker, target, options).await;
            }
            Err(err) => warn!(error = %err, "websocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())
        .map_err(|err| ControlError::Engine(err.to_string()))
}

async fn stream_logs<S>(
    ws: WebSocketStream<S>,
    docker: Docker,
    id: String,
    options: LogsOptions<String>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut logs = Box::pin(docker.logs(&id, Some(options)));

    loop {
        tokio::select! {
            chunk = logs.next() => match chunk {
                Some(Ok(output)) => {
                    if sink
                        .send(Message::Binary(output.into_bytes().to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(err)) => {
                    let _ = sink.send(Message::Text(format!("log stream error: {err}"))).await;
                    break;
                }
                None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!(container = %id, "log stream closed");
}

/// Lists the service's own containers, scoping any control action to them.
async fn service_containers(
    docker: &Docker,
    service: &str,
) -> Result<Vec<ContainerSummary>, ControlError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![format!("{service}{MATCH_KEY}")]);

    docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .map_err(|err| ControlError::Engine(err.to_string()))
}

/// Resolves the `id` parameter to a container of this service, by id, id
/// prefix or name. Containers of other services are never reachable.
async fn resolve_target(
    docker: &Docker,
    service: &str,
    wanted: &str,
) -> Result<String, ControlError> {
    for summary in service_containers(docker, service).await? {
        let Some(id) = summary.id else { continue };
        let names = summary.names.unwrap_or_default();
        if id == wanted
            || id.starts_with(wanted)
            || names.iter().any(|name| name.trim_start_matches('/') == wanted)
        {
            return Ok(id);
        }
    }
    Err(ControlError::Engine(format!(
        "no service container matches {wanted:?}"
    )))
}

async fn lifecycle(
    action: &str,
    docker: Docker,
    container: &Container,
    mut req: Request<Body>,
) -> Result<Response<Body>, ControlError> {
    let params = form_params(&mut req).await;
    let wanted = params
        .get("id")
        .cloned()
        .unwrap_or_else(|| container.id.clone());
    let target = resolve_target(&docker, &container.name, &wanted).await?;

    let result = match action {
        "docker/start" => docker.start_container::<String>(&target, None).await,
        "docker/stop" => {
            docker
                .stop_container(&target, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
                .await
        }
        _ => {
            docker
                .restart_container(
                    &target,
                    Some(RestartContainerOptions {
                        t: STOP_TIMEOUT_SECS as isize,
                    }),
                )
                .await
        }
    };
    result.map_err(|err| ControlError::Engine(err.to_string()))?;

    debug!(action, container = %target, "lifecycle action finished");
    Ok(text_response("ok"))
}

/// One tab-separated row per service container: id, name, image, created,
/// status.
async fn ps(docker: Docker, container: &Container) -> Result<Response<Body>, ControlError> {
    let mut summaries = service_containers(&docker, &container.name).await?;
    summaries.sort_by(|a, b| a.names.cmp(&b.names));

    let mut rows = String::new();
    for summary in summaries {
        let id = summary.id.unwrap_or_default();
        let name = summary
            .names
            .unwrap_or_default()
            .first()
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let image = summary.image.unwrap_or_default();
        let created_ts = summary.created.unwrap_or_default();
        let created = OffsetDateTime::from_unix_timestamp(created_ts)
            .ok()
            .and_then(|stamp| stamp.format(&Rfc3339).ok())
            .unwrap_or_else(|| created_ts.to_string());
        let status = summary.status.unwrap_or_default();

        rows.push_str(&format!("{id}\t{name}\t{image}\t{created}\t{status}\n"));
    }

    Ok(text_response(rows))
}

fn text_response(body: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body.into()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Container {
        Container {
            id: "c1".to_string(),
            name: "web".to_string(),
            version: "v1.2".to_string(),
            token: "secret".to_string(),
            ..Container::default()
        }
    }

    fn request_with_auth(user: &str, password: &str) -> Request<Body> {
        let encoded = BASE64.encode(format!("{user}:{password}"));
        Request::builder()
            .uri("/_s/docker/ps")
            .header(AUTHORIZATION, format!("Basic {encoded}"))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_authorize_accepts_matching_credentials() {
        assert!(authorize(&container(), &request_with_auth("web", "secret")).is_ok());
    }

    #[test]
    fn test_authorize_rejects_wrong_password() {
        let err = authorize(&container(), &request_with_auth("web", "nope")).unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized("invalid password")));
    }

    #[test]
    fn test_authorize_rejects_unknown_user() {
        let err = authorize(&container(), &request_with_auth("other", "secret")).unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized("unauthorized")));
    }

    #[test]
    fn test_authorize_rejects_missing_header() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let err = authorize(&container(), &req).unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized("unauthorized")));
    }

    #[test]
    fn test_authorize_rejects_empty_token() {
        let mut no_token = container();
        no_token.token = String::new();
        let err = authorize(&no_token, &request_with_auth("web", "")).unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized("invalid password")));
    }

    #[test]
    fn test_logs_options_defaults() {
        let options = logs_options(&HashMap::new());
        assert!(options.stdout && options.stderr);
        assert!(!options.follow && !options.timestamps);
        assert_eq!(options.tail, "all");
        assert_eq!(options.since, 0);
    }

    #[test]
    fn test_logs_options_flags_require_one() {
        let params = HashMap::from([
            ("follow".to_string(), "1".to_string()),
            ("stdout".to_string(), "0".to_string()),
            ("since".to_string(), "1700000000".to_string()),
            ("tail".to_string(), "50".to_string()),
        ]);
        let options = logs_options(&params);
        assert!(options.follow);
        assert!(!options.stdout);
        assert!(options.stderr);
        assert_eq!(options.since, 1_700_000_000);
        assert_eq!(options.tail, "50");
    }

    #[tokio::test]
    async fn test_form_params_merges_query_and_body() {
        let mut req = Request::builder()
            .uri("/_s/docker/stop?id=aaa")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("id=bbb&extra=1"))
            .unwrap();

        let params = form_params(&mut req).await;
        assert_eq!(params.get("id"), Some(&"bbb".to_string()));
        assert_eq!(params.get("extra"), Some(&"1".to_string()));
    }
}
