use http::header::HOST;
use hyper::{Body, Request};

/// Retrieves the request host (without the port) from the Host header, or
/// from the URI authority for HTTP/2 requests.
pub fn request_host(req: &Request<Body>) -> String {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host());

    raw.and_then(|host| host.split(':').next())
        .unwrap_or("")
        .to_string()
}

/// Returns the first query-string value with the given name.
pub fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Minimal HTML escaping for text interpolated into the index page.
pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host_strips_port() {
        let req = Request::builder()
            .uri("/index")
            .header(HOST, "apiv12.web.example:8080")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_host(&req), "apiv12.web.example");
    }

    #[test]
    fn test_query_param() {
        let req = Request::builder()
            .uri("/_s/docker/logs?tail=100&follow=1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(query_param(&req, "tail"), Some("100".to_string()));
        assert_eq!(query_param(&req, "follow"), Some("1".to_string()));
        assert_eq!(query_param(&req, "since"), None);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<a&\"b>"), "&lt;a&amp;&quot;b&gt;");
    }
}
