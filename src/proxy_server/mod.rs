use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tracing::info;

use crate::{stores, tools, Gateway};

pub mod control;
pub mod preview;
pub mod reverse;

/// Binds the front door and serves until the process exits. Every request is
/// dispatched by virtual host: a match goes to the control surface or the
/// reverse proxy, everything else gets the index page.
pub async fn run(gateway: Arc<Gateway>) -> Result<(), anyhow::Error> {
    let addr: SocketAddr = gateway
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote = conn.remote_addr();
        let gateway = gateway.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(gateway.clone(), remote, req)))
        }
    });

    info!(address = %addr, "front door listening");
    Server::try_bind(&addr)
        .context("could not bind front door")?
        .serve(make_svc)
        .await
        .context("front door server failed")
}

async fn handle(
    gateway: Arc<Gateway>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let host = tools::request_host(&req);

    let response = match stores::find_route(&host) {
        Some(entry) => {
            if req.uri().path().starts_with(gateway.config.srv_prefix.as_str()) {
                control::handle(&gateway, &entry.container, req).await
            } else {
                reverse::proxy(&gateway, &entry, remote, req).await
            }
        }
        None => preview::render(&gateway, &host, &req),
    };

    info!(
        method = %method,
        path = %path,
        host = %host,
        client_ip = %remote,
        status_code = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        access_log = true,
        "request served"
    );

    Ok(response)
}
