//! Process-wide model and connector registry
//!
//! Models and connectors register themselves at construction so that
//! tooling can enumerate them and observers can react to registration.
//! The registry is an explicit object rather than ambient module state;
//! [`Registry::reset`] exists for test isolation and must not be called
//! from production code paths.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::connector::Connector;
use crate::model::Model;

type ModelObserver = Arc<dyn Fn(&Arc<Model>) + Send + Sync>;
type ConnectorObserver = Arc<dyn Fn(&Arc<Connector>) + Send + Sync>;

/// Ordered registries of models and connectors, with typed register
/// observers for both.
#[derive(Default)]
pub struct Registry {
    models: RwLock<Vec<Arc<Model>>>,
    connectors: RwLock<Vec<Arc<Connector>>>,
    model_observers: Mutex<Vec<ModelObserver>>,
    connector_observers: Mutex<Vec<ConnectorObserver>>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::default)
    }

    /// All registered models, in registration order.
    pub fn models(&self) -> Vec<Arc<Model>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The first registered model with the given name.
    pub fn model(&self, name: &str) -> Option<Arc<Model>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// All registered connectors, in registration order.
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The first registered connector with the given name.
    pub fn connector(&self, name: &str) -> Option<Arc<Connector>> {
        self.connectors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Observe model registration.
    pub fn on_model_register<F>(&self, observer: F)
    where
        F: Fn(&Arc<Model>) + Send + Sync + 'static,
    {
        self.model_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    /// Observe connector registration.
    pub fn on_connector_register<F>(&self, observer: F)
    where
        F: Fn(&Arc<Connector>) + Send + Sync + 'static,
    {
        self.connector_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    pub(crate) fn register_model(&self, model: &Arc<Model>) {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(model.clone());
        // Snapshot the observer list so callbacks run without the lock.
        let observers: Vec<ModelObserver> = self
            .model_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer(model);
        }
    }

    pub(crate) fn register_connector(&self, connector: &Arc<Connector>) {
        self.connectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(connector.clone());
        let observers: Vec<ConnectorObserver> = self
            .connector_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer(connector);
        }
    }

    /// Clear the registered model and connector lists.
    ///
    /// Test isolation only: production code must never reset the registry.
    pub fn reset(&self) {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.connectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::model::ModelDefinition;

    fn unique(name: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static N: AtomicU64 = AtomicU64::new(0);
        format!("{}_{}", name, N.fetch_add(1, Ordering::Relaxed))
    }

    // Registration against a local registry keeps these tests isolated
    // from the global one the rest of the suite shares.
    #[test]
    fn test_register_notifies_observers() {
        let registry = Registry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry.on_model_register(move |model| {
                seen.lock().unwrap().push(model.name().to_string());
            });
        }

        let model = Model::define(unique("observed"), ModelDefinition::new()).unwrap();
        registry.register_model(&model);

        assert_eq!(registry.models().len(), 1);
        assert!(registry.model(model.name()).is_some());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[model.name().to_string()]
        );
    }

    #[test]
    fn test_registration_order_is_preserved() {
        let registry = Registry::default();
        let first = Model::define(unique("first"), ModelDefinition::new()).unwrap();
        let second = Model::define(unique("second"), ModelDefinition::new()).unwrap();
        registry.register_model(&first);
        registry.register_model(&second);

        let names: Vec<String> = registry
            .models()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec![first.name(), second.name()]);
    }

    #[test]
    fn test_reset_clears_registrations() {
        let registry = Registry::default();
        let model = Model::define(unique("resettable"), ModelDefinition::new()).unwrap();
        let connector = MemoryBackend::connector().unwrap();
        registry.register_model(&model);
        registry.register_connector(&connector);
        assert!(!registry.models().is_empty());
        assert!(registry.connector(connector.name()).is_some());

        registry.reset();
        assert!(registry.models().is_empty());
        assert!(registry.connectors().is_empty());
        assert!(registry.model(model.name()).is_none());
    }
}
