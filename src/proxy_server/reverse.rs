use std::net::SocketAddr;

use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, StatusCode, Uri};
use hyper::{Body, Request, Response};
use tracing::warn;

use crate::stores::ReverseEntry;
use crate::Gateway;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Hop-by-hop headers are meaningful per connection and are stripped in both
/// directions.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) {
    let client = remote.ip().to_string();
    let value = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|prior| prior.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client}"),
        None => client,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}

/// Points the request at the forward's upstream, preserving path, query and
/// method.
pub(crate) fn proxied_uri(target: &Uri, req: &Request<Body>) -> Result<Uri, http::Error> {
    let authority = target
        .authority()
        .map(http::uri::Authority::as_str)
        .unwrap_or_default();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);

    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

/// Dispatches the request to the forward's upstream through the shared
/// client and relays the response. Upstream failures answer 502.
pub async fn proxy(
    gateway: &Gateway,
    entry: &ReverseEntry,
    remote: SocketAddr,
    mut req: Request<Body>,
) -> Response<Body> {
    let uri = match proxied_uri(&entry.target, &req) {
        Ok(uri) => uri,
        Err(err) => {
            warn!(upstream = %entry.forward.uri, error = %err, "could not build upstream uri");
            return status_response(StatusCode::BAD_GATEWAY, "bad gateway");
        }
    };

    *req.uri_mut() = uri;
    remove_hop_headers(req.headers_mut());
    append_forwarded_for(req.headers_mut(), remote);
    if let Ok(host) = HeaderValue::from_str(&entry.forward.uri) {
        req.headers_mut().insert(HOST, host);
    }

    match gateway.http_client.request(req).await {
        Ok(mut response) => {
            remove_hop_headers(response.headers_mut());
            response
        }
        Err(err) => {
            warn!(upstream = %entry.forward.uri, error = %err, "upstream request failed");
            status_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
    }
}

pub(crate) fn status_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}
