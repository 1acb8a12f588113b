//! Mapping from host identity to backend constructor.

use super::{cluster, local, Backend, BackendContext};
use crate::error::{Result, SubmitError};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Builds a backend from its context.
pub type BackendFactory = fn(BackendContext) -> Box<dyn Backend>;

/// Outcome of a lookup.
#[derive(Clone, Copy)]
pub struct Resolved {
    /// Registry name of the chosen backend.
    pub name: &'static str,
    pub factory: BackendFactory,
    /// True when the lookup failed and the local backend was substituted.
    pub fell_back: bool,
}

/// Backend constructors keyed by host identity.
///
/// Built once at startup; each backend module adds itself through its
/// own `register` function.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the backends shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        local::register(&mut registry);
        cluster::register(&mut registry);
        registry
    }

    /// Associate a host identity with a constructor, replacing any previous one.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        debug!("Registering backend {}", name);
        self.factories.insert(name, factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Look up a host identity, falling back to the local backend with a warning.
    pub fn resolve(&self, host: Option<&str>) -> Resolved {
        if let Some(found) = host.and_then(|h| self.lookup(h)) {
            return found;
        }

        warn!(
            "No backend implemented for host {}! Using the local backend, cluster operations will not be available.",
            host.unwrap_or("<unset>")
        );
        Resolved {
            name: local::BACKEND_NAME,
            factory: self
                .factories
                .get(local::BACKEND_NAME)
                .copied()
                .unwrap_or(local::LocalBackend::create),
            fell_back: true,
        }
    }

    /// Look up an explicitly requested backend; unknown names are an error.
    pub fn resolve_strict(&self, name: &str) -> Result<Resolved> {
        self.lookup(name).ok_or_else(|| SubmitError::UnknownBackend {
            requested: name.to_string(),
            known: self.names().join(", "),
        })
    }

    fn lookup(&self, name: &str) -> Option<Resolved> {
        self.factories
            .get_key_value(name)
            .map(|(name, factory)| Resolved {
                name: *name,
                factory: *factory,
                fell_back: false,
            })
    }
}
