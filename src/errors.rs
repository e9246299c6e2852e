use thiserror::Error;

/// Failures surfaced by the gateway's background passes. Request-path errors
/// (control surface, proxying) are mapped to HTTP responses where they occur.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The engine client could not be built: the finder script failed, the
    /// TLS material was unreadable, or the client constructor rejected the
    /// address.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(#[source] anyhow::Error),

    /// Listing or inspecting containers failed. A refresh hitting this leaves
    /// the live proxy set untouched.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(#[source] bollard::errors::Error),

    /// A housekeeper pass (clear or prune) aborted on its first error. The
    /// next scheduled pass retries.
    #[error("housekeeper pass failed: {0}")]
    Housekeeper(#[source] anyhow::Error),
}

/// Reasons a single `PD_*` label is skipped during discovery. Never fatal:
/// the offending label is logged and the rest of the container still parses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("missing ':port' segment")]
    MissingPort,

    #[error("port is not a number")]
    BadPort,

    #[error("missing bind address before '/'")]
    MissingBind,

    #[error("internal port {0} has no published host port")]
    UnpublishedPort(u16),
}
