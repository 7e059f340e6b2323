//! Explicit service registry.
//!
//! Shared services (the execution queue, configuration, coordinators) are
//! registered under a name, built lazily on first resolve and cached.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceRegistry) -> Instance + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("No service registered under '{0}'")]
    NotFound(String),

    #[error("Service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

struct Entry {
    type_id: TypeId,
    factory: Option<Factory>,
    instance: Option<Instance>,
}

/// Named, lazily-instantiated services.
///
/// Factories receive the registry, so a service may resolve the services it
/// depends on. Each factory runs without the registry lock held.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `T`'s type name.
    pub fn register<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceRegistry) -> T + Send + Sync + 'static,
    {
        self.register_named(type_name::<T>(), factory);
    }

    /// Register a factory under `name`, replacing any earlier registration.
    pub fn register_named<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceRegistry) -> T + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(service = %name, "Service registered");
        self.lock().insert(
            name,
            Entry {
                type_id: TypeId::of::<T>(),
                factory: Some(Arc::new(move |registry: &ServiceRegistry| {
                    Arc::new(factory(registry)) as Instance
                })),
                instance: None,
            },
        );
    }

    /// Register a ready-made instance under `T`'s type name.
    pub fn insert<T: Send + Sync + 'static>(&self, instance: T) {
        self.insert_named(type_name::<T>(), instance);
    }

    pub fn insert_named<T: Send + Sync + 'static>(&self, name: impl Into<String>, instance: T) {
        self.lock().insert(
            name.into(),
            Entry {
                type_id: TypeId::of::<T>(),
                factory: None,
                instance: Some(Arc::new(instance)),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Resolve the service registered under `T`'s type name.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        self.resolve_named(type_name::<T>())
    }

    pub fn resolve_named<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        let mismatch = || ResolveError::TypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        };

        let factory = {
            let entries = self.lock();
            let entry = entries
                .get(name)
                .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;
            if entry.type_id != TypeId::of::<T>() {
                return Err(mismatch());
            }
            if let Some(instance) = &entry.instance {
                return instance.clone().downcast::<T>().map_err(|_| mismatch());
            }
            match &entry.factory {
                Some(factory) => factory.clone(),
                None => return Err(ResolveError::NotFound(name.to_string())),
            }
        };

        let built = factory(self);
        debug!(service = %name, "Service instantiated");

        // Another resolve may have raced us; the first stored instance wins.
        let instance = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;
            entry.instance.get_or_insert(built).clone()
        };
        instance.downcast::<T>().map_err(|_| mismatch())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}
