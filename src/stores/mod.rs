use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

pub mod proxies;

pub use proxies::{ListenerEntry, Plane, ReverseEntry};

// The live proxy plane: one readers-writer lock over the three maps so a
// reader never observes a half-committed refresh.
static PLANE: Lazy<RwLock<Plane>> = Lazy::new(|| RwLock::new(Plane::default()));

pub fn read() -> RwLockReadGuard<'static, Plane> {
    PLANE.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write() -> RwLockWriteGuard<'static, Plane> {
    PLANE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clones the reverse-proxy entry matched by the given request host, if any.
pub fn find_route(host: &str) -> Option<ReverseEntry> {
    read().match_host(host).cloned()
}
