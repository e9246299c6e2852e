use std::collections::HashMap;

use tracing::{debug, warn};

use crate::docker::discovery::{self, Container, Forward, ForwardKind};
use crate::errors::GatewayError;
use crate::services::forwarder::{self, Bound};
use crate::stores::{self, ListenerEntry, Plane, ReverseEntry};
use crate::Gateway;

/// What one reconciliation pass did to the live set. `dropped` keeps the
/// container snapshots of removed prefixes so trigger scripts can still be
/// fed their metadata.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub all: HashMap<String, Container>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub dropped: HashMap<String, Container>,
}

impl RefreshOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Diff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// A live entry is replaced when the forward's kind, upstream or wildcard
/// flag differs; everything else about the declaration is carried by the
/// prefix itself.
pub(crate) fn forward_changed(old: &Forward, new: &Forward) -> bool {
    old.kind != new.kind || old.uri != new.uri || old.wildcard != new.wildcard
}

/// Pure diff of discovery output against the previous live set, bucketed by
/// prefix. A prefix lands in exactly one bucket.
pub(crate) fn diff(old: &HashMap<String, Container>, new: &HashMap<String, Container>) -> Diff {
    let mut result = Diff::default();

    for (prefix, container) in new {
        let Some(forward) = container.forwards.get(prefix) else {
            continue;
        };
        match old.get(prefix).and_then(|c| c.forwards.get(prefix)) {
            None => result.added.push(prefix.clone()),
            Some(previous) if forward_changed(previous, forward) => {
                result.updated.push(prefix.clone());
            }
            Some(_) => result.unchanged.push(prefix.clone()),
        }
    }

    for prefix in old.keys() {
        if !new.contains_key(prefix) {
            result.removed.push(prefix.clone());
        }
    }

    result.added.sort();
    result.updated.sort();
    result.removed.sort();
    result.unchanged.sort();
    result
}

/// Runs one reconciliation pass: discover, pre-bind changed stream sockets,
/// then commit the diff under the plane's writer lock. Discovery or
/// inspection failures abort before the plane is touched.
pub async fn refresh(gateway: &Gateway) -> Result<RefreshOutcome, GatewayError> {
    let (docker, engine_host) = gateway.engine.get().await?;
    let discovered = discovery::discover(&docker, &engine_host).await?;

    // Close stream listeners about to be replaced so their addresses free up,
    // and collect the binds this pass needs. No await happens under the lock.
    let needs_bind: Vec<String> = {
        let mut plane = stores::write();
        let mut needs = Vec::new();
        for (prefix, container) in &discovered {
            let Some(forward) = container.forwards.get(prefix) else {
                continue;
            };
            if forward.kind == ForwardKind::Http {
                continue;
            }
            let unchanged = plane
                .all
                .get(prefix)
                .and_then(|c| c.forwards.get(prefix))
                .map(|previous| !forward_changed(previous, forward))
                .unwrap_or(false);
            let live = plane
                .listen
                .get(prefix)
                .map(ListenerEntry::is_live)
                .unwrap_or(false);
            if unchanged && live {
                continue;
            }
            if let Some(entry) = plane.listen.remove(prefix) {
                entry.close();
            }
            needs.push(prefix.clone());
        }
        needs
    };

    let mut bound = HashMap::new();
    for prefix in needs_bind {
        let Some(forward) = discovered.get(&prefix).and_then(|c| c.forwards.get(&prefix)) else {
            continue;
        };
        match forwarder::bind(forward).await {
            Ok(socket) => {
                bound.insert(prefix, socket);
            }
            Err(err) => {
                warn!(prefix = %prefix, key = %forward.key, error = %err, "listener setup failed");
            }
        }
    }

    let mut plane = stores::write();
    Ok(commit(
        &mut plane,
        &discovered,
        bound,
        &gateway.config.host_suffix,
    ))
}

/// Applies the diff to the plane. Synchronous on purpose: the caller holds
/// the writer lock and every socket was bound beforehand.
pub(crate) fn commit(
    plane: &mut Plane,
    discovered: &HashMap<String, Container>,
    mut bound: HashMap<String, Bound>,
    host_suffix: &str,
) -> RefreshOutcome {
    let buckets = diff(&plane.all, discovered);
    let old_all = std::mem::take(&mut plane.all);

    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut removed = Vec::new();
    let mut dropped = HashMap::new();

    for prefix in &buckets.unchanged {
        if let Some(container) = discovered.get(prefix) {
            install(plane, container, prefix, &mut bound, host_suffix);
        }
    }

    for prefix in &buckets.added {
        let Some(container) = discovered.get(prefix) else {
            continue;
        };
        if install(plane, container, prefix, &mut bound, host_suffix) {
            debug!(prefix = %prefix, "proxy added");
            added.push(prefix.clone());
        }
    }

    for prefix in &buckets.updated {
        let Some(container) = discovered.get(prefix) else {
            continue;
        };
        if install(plane, container, prefix, &mut bound, host_suffix) {
            debug!(prefix = %prefix, "proxy updated");
            updated.push(prefix.clone());
        }
    }

    for prefix in &buckets.removed {
        let host = format!("{prefix}{host_suffix}");
        plane.reverse.remove(&host);
        if let Some(entry) = plane.listen.remove(prefix) {
            entry.close();
        }
        if let Some(container) = old_all.get(prefix) {
            dropped.insert(prefix.clone(), container.clone());
        }
        debug!(prefix = %prefix, "proxy removed");
        removed.push(prefix.clone());
    }

    RefreshOutcome {
        all: plane.all.clone(),
        added,
        updated,
        removed,
        dropped,
    }
}

/// Makes the plane hold a live entry for the given prefix, reusing an
/// unchanged one where possible. Returns false when the entry could not be
/// installed (failed bind, invalid upstream); the prefix then stays out of
/// the live set and the next pass retries it.
fn install(
    plane: &mut Plane,
    container: &Container,
    prefix: &str,
    bound: &mut HashMap<String, Bound>,
    host_suffix: &str,
) -> bool {
    let Some(forward) = container.forwards.get(prefix) else {
        return false;
    };
    let host = format!("{prefix}{host_suffix}");

    match forward.kind {
        ForwardKind::Http => {
            // a kind change tears the old listener down
            if let Some(entry) = plane.listen.remove(prefix) {
                entry.close();
            }

            let keep = plane
                .reverse
                .get(&host)
                .map(|entry| !forward_changed(&entry.forward, forward))
                .unwrap_or(false);
            if keep {
                if let Some(entry) = plane.reverse.get_mut(&host) {
                    entry.container = container.clone();
                }
            } else {
                match ReverseEntry::build(forward, container) {
                    Ok(entry) => {
                        plane.reverse.insert(host, entry);
                    }
                    Err(err) => {
                        warn!(prefix = %prefix, uri = %forward.uri, error = %err, "invalid upstream uri");
                        plane.reverse.remove(&host);
                        return false;
                    }
                }
            }
        }
        ForwardKind::Tcp | ForwardKind::Udp => {
            plane.reverse.remove(&host);

            let keep = plane
                .listen
                .get(prefix)
                .map(|entry| entry.is_live() && !forward_changed(&entry.forward, forward))
                .unwrap_or(false);
            if keep {
                if let Some(entry) = plane.listen.get_mut(prefix) {
                    entry.container = container.clone();
                }
            } else {
                if let Some(entry) = plane.listen.remove(prefix) {
                    entry.close();
                }
                let Some(socket) = bound.remove(prefix) else {
                    return false;
                };
                let task = forwarder::spawn(forward.clone(), socket);
                plane.listen.insert(
                    prefix.to_string(),
                    ListenerEntry {
                        forward: forward.clone(),
                        container: container.clone(),
                        task,
                    },
                );
            }
        }
    }

    plane.all.insert(prefix.to_string(), container.clone());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(kind: ForwardKind, prefix: &str, key: &str, uri: &str) -> Forward {
        Forward {
            name: "f".to_string(),
            kind,
            key: key.to_string(),
            prefix: prefix.to_string(),
            uri: uri.to_string(),
            wildcard: false,
        }
    }

    fn container(id: &str, forwards: Vec<Forward>) -> Container {
        Container {
            id: id.to_string(),
            name: "web".to_string(),
            version: "v1.2".to_string(),
            token: "secret".to_string(),
            forwards: forwards
                .into_iter()
                .map(|f| (f.prefix.clone(), f))
                .collect(),
            ..Container::default()
        }
    }

    fn http_set(uri: &str) -> HashMap<String, Container> {
        let fwd = forward(ForwardKind::Http, "apiv12.web", "api", uri);
        HashMap::from([("apiv12.web".to_string(), container("c1", vec![fwd]))])
    }

    #[test]
    fn test_diff_buckets_are_disjoint_and_complete() {
        let old = http_set("10.0.0.5:32001");
        let mut new = http_set("10.0.0.5:32002"); // updated
        let tcp = forward(
            ForwardKind::Tcp,
            "tcp://127.0.0.1:5432",
            "127.0.0.1:5432",
            "10.0.0.5:32003",
        );
        new.insert(
            "tcp://127.0.0.1:5432".to_string(),
            container("c2", vec![tcp]),
        );

        let result = diff(&old, &new);
        assert_eq!(result.added, vec!["tcp://127.0.0.1:5432"]);
        assert_eq!(result.updated, vec!["apiv12.web"]);
        assert!(result.removed.is_empty());
        assert!(result.unchanged.is_empty());

        // every prefix of both sets appears in exactly one bucket
        let mut seen: Vec<&String> = result
            .added
            .iter()
            .chain(&result.updated)
            .chain(&result.removed)
            .chain(&result.unchanged)
            .collect();
        seen.sort();
        seen.dedup();
        let mut union: Vec<&String> = old.keys().chain(new.keys()).collect();
        union.sort();
        union.dedup();
        assert_eq!(seen, union);
    }

    #[test]
    fn test_diff_same_uri_is_unchanged() {
        let old = http_set("10.0.0.5:32001");
        let new = http_set("10.0.0.5:32001");

        let result = diff(&old, &new);
        assert_eq!(result.unchanged, vec!["apiv12.web"]);
        assert!(result.added.is_empty() && result.updated.is_empty() && result.removed.is_empty());
    }

    #[test]
    fn test_diff_kind_change_is_update() {
        let old = http_set("10.0.0.5:32001");
        let mut new = http_set("10.0.0.5:32001");
        let entry = new.get_mut("apiv12.web").unwrap();
        let stream = forward(
            ForwardKind::Tcp,
            "apiv12.web",
            "127.0.0.1:9000",
            "10.0.0.5:32001",
        );
        entry.forwards.insert("apiv12.web".to_string(), stream);

        let result = diff(&old, &new);
        assert_eq!(result.updated, vec!["apiv12.web"]);
    }

    #[test]
    fn test_diff_removal() {
        let old = http_set("10.0.0.5:32001");
        let new = HashMap::new();

        let result = diff(&old, &new);
        assert_eq!(result.removed, vec!["apiv12.web"]);
    }

    #[tokio::test]
    async fn test_commit_http_add_update_remove() {
        let mut plane = Plane::default();

        let outcome = commit(&mut plane, &http_set("10.0.0.5:32001"), HashMap::new(), ".example");
        assert_eq!(outcome.added, vec!["apiv12.web"]);
        let entry = plane.reverse.get("apiv12.web.example").expect("route");
        assert_eq!(entry.target.to_string(), "http://10.0.0.5:32001/");

        // same uri: nothing replaced
        let outcome = commit(&mut plane, &http_set("10.0.0.5:32001"), HashMap::new(), ".example");
        assert!(outcome.is_unchanged());

        // published port moved: entry rebuilt in place, no removal
        let outcome = commit(&mut plane, &http_set("10.0.0.5:32002"), HashMap::new(), ".example");
        assert_eq!(outcome.updated, vec!["apiv12.web"]);
        assert!(outcome.removed.is_empty());
        let entry = plane.reverse.get("apiv12.web.example").expect("route");
        assert_eq!(entry.target.to_string(), "http://10.0.0.5:32002/");

        // container gone
        let outcome = commit(&mut plane, &HashMap::new(), HashMap::new(), ".example");
        assert_eq!(outcome.removed, vec!["apiv12.web"]);
        assert!(plane.reverse.is_empty());
        assert!(plane.all.is_empty());
        assert_eq!(
            outcome.dropped.get("apiv12.web").map(|c| c.id.as_str()),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn test_commit_tcp_add_and_remove() {
        let mut plane = Plane::default();
        let prefix = "tcp://127.0.0.1:0".to_string();
        let fwd = forward(ForwardKind::Tcp, &prefix, "127.0.0.1:0", "10.0.0.5:32003");
        let discovered = HashMap::from([(prefix.clone(), container("c2", vec![fwd.clone()]))]);

        let socket = forwarder::bind(&fwd).await.unwrap();
        let bound = HashMap::from([(prefix.clone(), socket)]);

        let outcome = commit(&mut plane, &discovered, bound, ".example");
        assert_eq!(outcome.added, vec![prefix.clone()]);
        assert!(plane.listen.get(&prefix).map(ListenerEntry::is_live).unwrap_or(false));

        let outcome = commit(&mut plane, &HashMap::new(), HashMap::new(), ".example");
        assert_eq!(outcome.removed, vec![prefix.clone()]);
        assert!(plane.listen.is_empty());
    }

    #[tokio::test]
    async fn test_commit_without_bound_socket_retries_later() {
        let mut plane = Plane::default();
        let prefix = "tcp://127.0.0.1:0".to_string();
        let fwd = forward(ForwardKind::Tcp, &prefix, "127.0.0.1:0", "10.0.0.5:32003");
        let discovered = HashMap::from([(prefix.clone(), container("c2", vec![fwd]))]);

        // bind failed upstream of commit: nothing is installed, nothing counted
        let outcome = commit(&mut plane, &discovered, HashMap::new(), ".example");
        assert!(outcome.added.is_empty());
        assert!(!plane.all.contains_key(&prefix));
    }
}
