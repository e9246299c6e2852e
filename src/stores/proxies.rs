use std::collections::HashMap;

use http::Uri;
use tokio::task::JoinHandle;

use crate::docker::discovery::{Container, Forward};

/// A live http forward: the prebuilt upstream base URI plus the owning
/// container snapshot, keyed in the plane by its virtual host.
#[derive(Debug, Clone)]
pub struct ReverseEntry {
    pub forward: Forward,
    pub container: Container,
    pub target: Uri,
}

impl ReverseEntry {
    pub fn build(forward: &Forward, container: &Container) -> Result<Self, http::uri::InvalidUri> {
        let target: Uri = format!("http://{}", forward.uri).parse()?;
        Ok(Self {
            forward: forward.clone(),
            container: container.clone(),
            target,
        })
    }
}

/// A live tcp/udp forward. Aborting the task closes its sockets; the accept
/// loop treats that as a normal termination.
#[derive(Debug)]
pub struct ListenerEntry {
    pub forward: Forward,
    pub container: Container,
    pub task: JoinHandle<()>,
}

impl ListenerEntry {
    pub fn close(&self) {
        self.task.abort();
    }

    pub fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

/// The three maps of the live set. `all` is keyed by forward prefix and owns
/// the notion of "who is live"; `reverse` (virtual host) and `listen`
/// (prefix) each hold exactly one entry per matching `all` member.
#[derive(Debug, Default)]
pub struct Plane {
    pub all: HashMap<String, Container>,
    pub reverse: HashMap<String, ReverseEntry>,
    pub listen: HashMap<String, ListenerEntry>,
}

impl Plane {
    /// Virtual-host lookup: an exact match wins; otherwise the wildcard entry
    /// with the longest suffix match is chosen, so nested wildcards resolve
    /// deterministically.
    pub fn match_host(&self, host: &str) -> Option<&ReverseEntry> {
        if let Some(entry) = self.reverse.get(host) {
            return Some(entry);
        }

        self.reverse
            .iter()
            .filter(|(vhost, entry)| entry.forward.wildcard && host.ends_with(vhost.as_str()))
            .max_by_key(|(vhost, _)| vhost.len())
            .map(|(_, entry)| entry)
    }
}
