use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::component::provider::Provider;
use crate::component::types::{ComponentError, DynService};
use crate::component::Component;

/// Per-app registry of named services. Each app owns its own container, so
/// two apps in one process never share instances.
#[derive(Clone)]
pub struct ComponentContainer {
    pub(crate) inner: Arc<ComponentContainerInner>,
}

pub(crate) struct ComponentContainerInner {
    pub name: Arc<str>,
    pub providers: Mutex<HashMap<Arc<str>, Provider>>,
}

impl ComponentContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ComponentContainerInner {
                name: Arc::from(name.into()),
                providers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_component(&self, component: Component) -> Result<(), ComponentError> {
        let provider = self.get_provider(component.name());
        provider.set_component(component)
    }

    pub fn add_or_overwrite_component(&self, component: Component) -> Result<(), ComponentError> {
        self.providers().remove(component.name());
        self.add_component(component)
    }

    pub fn provide_instance<T>(&self, name: &str, service: Arc<T>) -> Result<(), ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        self.get_provider(name).set_instance(service as DynService)
    }

    pub fn get<T>(&self, name: &str) -> Result<Arc<T>, ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        self.get_provider(name).get::<T>()
    }

    /// Like [`get`](Self::get) but maps "not registered" to `None`.
    pub fn get_optional<T>(&self, name: &str) -> Result<Option<Arc<T>>, ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        match self.get::<T>(name) {
            Ok(service) => Ok(Some(service)),
            Err(ComponentError::ComponentNotRegistered { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_provider(&self, name: &str) -> Provider {
        let mut providers = self.providers();
        if let Some(provider) = providers.get(name) {
            return provider.clone();
        }
        let provider = Provider::new(name, self);
        providers.insert(Arc::from(name.to_owned()), provider.clone());
        provider
    }

    /// Tears down every live instance. Registrations stay in place.
    pub fn teardown(&self) {
        let providers: Vec<Provider> = self.providers().values().cloned().collect();
        for provider in providers {
            provider.teardown();
        }
    }

    fn providers(&self) -> std::sync::MutexGuard<'_, HashMap<Arc<str>, Provider>> {
        self.inner.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
