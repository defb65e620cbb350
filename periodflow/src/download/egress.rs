//! Network egress paths and rotation between them.
//!
//! When a service keeps rate-limiting one path, the downloader asks the
//! rotator for another. What a path means (a proxy, a source address, an
//! API key) is up to the fetcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One way out to the external service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EgressPath {
    /// Stable name used in logs and rate-limit errors.
    pub name: String,
    /// Proxy URL, `None` for a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl EgressPath {
    /// A direct connection.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            name: "direct".to_string(),
            proxy: None,
        }
    }

    /// A path through `proxy`.
    #[must_use]
    pub fn via_proxy(name: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proxy: Some(proxy.into()),
        }
    }
}

impl fmt::Display for EgressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Chooses the egress path for new requests.
#[cfg_attr(test, mockall::automock)]
pub trait EgressRotator: Send + Sync {
    /// The path new requests should use.
    fn current(&self) -> EgressPath;

    /// Switches to the next path and returns it, or `None` if there is no
    /// alternative.
    fn rotate(&self) -> Option<EgressPath>;
}

/// Always the direct connection; rotation only backs off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectEgress;

impl EgressRotator for DirectEgress {
    fn current(&self) -> EgressPath {
        EgressPath::direct()
    }

    fn rotate(&self) -> Option<EgressPath> {
        None
    }
}

/// Cycles through a fixed pool of paths.
#[derive(Debug)]
pub struct RoundRobinEgress {
    paths: Vec<EgressPath>,
    index: AtomicUsize,
}

impl RoundRobinEgress {
    /// Creates a rotator over `paths`. An empty pool falls back to direct.
    #[must_use]
    pub fn new(paths: Vec<EgressPath>) -> Self {
        let paths = if paths.is_empty() {
            vec![EgressPath::direct()]
        } else {
            paths
        };
        Self {
            paths,
            index: AtomicUsize::new(0),
        }
    }

    /// Number of paths in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Always false; an empty pool is replaced by the direct path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl EgressRotator for RoundRobinEgress {
    fn current(&self) -> EgressPath {
        let index = self.index.load(Ordering::SeqCst) % self.paths.len();
        self.paths[index].clone()
    }

    fn rotate(&self) -> Option<EgressPath> {
        if self.paths.len() < 2 {
            return None;
        }
        let next = (self.index.fetch_add(1, Ordering::SeqCst) + 1) % self.paths.len();
        Some(self.paths[next].clone())
    }
}
