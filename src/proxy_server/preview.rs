use http::StatusCode;
use hyper::{Body, Request, Response};
use itertools::Itertools;

use crate::stores::Plane;
use crate::tools::{html_escape, query_param};
use crate::{stores, Gateway};

/// One candidate line of the index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostRow {
    pub service: String,
    pub version: String,
    pub forward: String,
    pub host: String,
}

/// Collects the live virtual hosts in presentation order: service name,
/// version, forward name, then host.
pub(crate) fn collect_rows(plane: &Plane) -> Vec<HostRow> {
    plane
        .reverse
        .iter()
        .map(|(host, entry)| HostRow {
            service: entry.container.name.clone(),
            version: entry.container.version.clone(),
            forward: entry.forward.name.clone(),
            host: host.clone(),
        })
        .sorted_by(|a, b| {
            (&a.service, &a.version, &a.forward, &a.host)
                .cmp(&(&b.service, &b.version, &b.forward, &b.host))
        })
        .collect()
}

fn rows_table(rows: &[HostRow], proto: &str) -> String {
    let mut table = String::from(
        "<table><tr><th>Service</th><th>Version</th><th>Forward</th><th>Host</th></tr>",
    );
    for row in rows {
        table.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td><a href=\"{}://{}\">{}</a></td></tr>",
            html_escape(&row.service),
            html_escape(&row.version),
            html_escape(&row.forward),
            html_escape(proto),
            html_escape(&row.host),
            html_escape(&row.host),
        ));
    }
    table.push_str("</table>");
    table
}

fn builtin_page(table: &str, message: Option<&str>) -> String {
    let banner = message
        .map(|text| format!("<p>{}</p>", html_escape(text)))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html><html><head><title>pdgate</title></head><body><h1>Services</h1>{banner}{table}</body></html>"
    )
}

/// Renders the fallback index page listing every live virtual host. Requests
/// for hosts other than the gateway's own answer 404 but still carry the
/// list, which keeps the page useful for diagnostics.
pub fn render(gateway: &Gateway, host: &str, req: &Request<Body>) -> Response<Body> {
    let message = query_param(req, "msg");
    let rows = collect_rows(&stores::read());
    let table = rows_table(&rows, &gateway.config.host_proto);

    let body = match &gateway.config.preview {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(template) => template
                .replace("{{hosts}}", &table)
                .replace("{{message}}", &message.as_deref().map(html_escape).unwrap_or_default()),
            Err(_) => builtin_page(&table, message.as_deref()),
        },
        None => builtin_page(&table, message.as_deref()),
    };

    let status = if !gateway.config.host_self.is_empty() && host == gateway.config.host_self {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };

    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::discovery::{Container, Forward, ForwardKind};
    use crate::stores::ReverseEntry;

    fn entry(service: &str, version: &str, forward: &str, host: &str) -> (String, ReverseEntry) {
        let fwd = Forward {
            name: forward.to_string(),
            kind: ForwardKind::Http,
            key: forward.to_string(),
            prefix: host.trim_end_matches(".example").to_string(),
            uri: "10.0.0.5:32001".to_string(),
            wildcard: false,
        };
        let container = Container {
            id: "c".to_string(),
            name: service.to_string(),
            version: version.to_string(),
            ..Container::default()
        };
        (
            host.to_string(),
            ReverseEntry::build(&fwd, &container).unwrap(),
        )
    }

    #[test]
    fn test_rows_are_lexicographically_ordered() {
        let plane = Plane {
            reverse: vec![
                entry("web", "v1.2", "ui", "uiv12.web.example"),
                entry("api", "v2.0", "rpc", "rpcv20.api.example"),
                entry("web", "v1.1", "api", "apiv11.web.example"),
                entry("web", "v1.2", "api", "apiv12.web.example"),
            ]
            .into_iter()
            .collect(),
            ..Plane::default()
        };

        let rows: Vec<String> = collect_rows(&plane)
            .into_iter()
            .map(|row| format!("{}/{}/{}", row.service, row.version, row.forward))
            .collect();
        assert_eq!(
            rows,
            vec!["api/v2.0/rpc", "web/v1.1/api", "web/v1.2/api", "web/v1.2/ui"]
        );
    }

    #[test]
    fn test_table_escapes_and_links() {
        let rows = vec![HostRow {
            service: "web<b>".to_string(),
            version: "v1".to_string(),
            forward: "api".to_string(),
            host: "apiv1.web.example".to_string(),
        }];
        let table = rows_table(&rows, "https");
        assert!(table.contains("web&lt;b&gt;"));
        assert!(table.contains("href=\"https://apiv1.web.example\""));
    }
}
