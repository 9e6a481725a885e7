//! Engine registry.
//!
//! Built once at startup, then shared behind an `Arc` for lookups.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use stockade_common::error::{Result, StockadeError};
use stockade_common::types::EngineName;

use super::EngineOperations;
use super::imgbuild::ImageBuildEngine;
use super::oci::OciEngine;
use super::standard::StandardEngine;
use crate::rpc::{HostMethods, Methods};

/// Produces a fresh engine instance per container construction.
pub type EngineFactory = fn() -> Box<dyn EngineOperations>;

/// Lifecycle operations and operation catalogue of one engine.
#[derive(Clone)]
pub struct EngineRegistration {
    /// Registry key.
    pub name: EngineName,
    /// Engine constructor.
    pub operations: EngineFactory,
    /// Operations the engine's privileged server exposes.
    pub methods: Arc<dyn Methods>,
}

impl fmt::Debug for EngineRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EngineRegistration {
    /// Creates a new engine instance.
    #[must_use]
    pub fn instantiate(&self) -> Box<dyn EngineOperations> {
        (self.operations)()
    }
}

/// Name-keyed table of engines.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineName, EngineRegistration>,
}

impl EngineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the `standard`, `oci` and `imgbuild`
    /// engines, all backed by [`HostMethods`].
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let host: Arc<dyn Methods> = Arc::new(HostMethods);
        let builtin: [(&str, EngineFactory); 3] = [
            (StandardEngine::NAME, StandardEngine::boxed),
            (OciEngine::NAME, OciEngine::boxed),
            (ImageBuildEngine::NAME, ImageBuildEngine::boxed),
        ];
        for (name, factory) in builtin {
            let _ = registry.register(EngineName::new(name), factory, Arc::clone(&host));
        }
        registry
    }

    /// Registers an engine under `name`.
    ///
    /// A later registration replaces an earlier one; the replaced
    /// registration is returned.
    pub fn register(
        &mut self,
        name: EngineName,
        operations: EngineFactory,
        methods: Arc<dyn Methods>,
    ) -> Option<EngineRegistration> {
        let registration = EngineRegistration {
            name: name.clone(),
            operations,
            methods,
        };
        let previous = self.engines.insert(name, registration);
        if let Some(previous) = &previous {
            tracing::warn!(engine = %previous.name, "engine registration replaced");
        } else {
            tracing::debug!(engines = self.engines.len(), "engine registered");
        }
        previous
    }

    /// Looks up the engine registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] for an unknown name.
    pub fn lookup(&self, name: &EngineName) -> Result<&EngineRegistration> {
        self.engines.get(name).ok_or_else(|| StockadeError::NotFound {
            kind: "engine",
            id: name.to_string(),
        })
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&EngineName> {
        let mut names: Vec<_> = self.engines.keys().collect();
        names.sort();
        names
    }
}
