use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::component::component::Component;
use crate::component::container::{ComponentContainer, ComponentContainerInner};
use crate::component::types::{ComponentError, DynService, InstantiationMode};

/// Holds the registration and the single live instance for one component name.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    name: Arc<str>,
    container: Weak<ComponentContainerInner>,
    component: Mutex<Option<Component>>,
    instance: Mutex<Option<DynService>>,
    initializing: AtomicBool,
}

impl Provider {
    pub(crate) fn new(name: &str, container: &ComponentContainer) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                name: Arc::from(name.to_owned()),
                container: Arc::downgrade(&container.inner),
                component: Mutex::new(None),
                instance: Mutex::new(None),
                initializing: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_component_set(&self) -> bool {
        self.component().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn component(&self) -> Option<Component> {
        self.inner
            .component
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_component(&self, component: Component) -> Result<(), ComponentError> {
        let already_built = self.is_initialized();
        {
            let mut guard = self.inner.component.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_some() || already_built {
                return Err(ComponentError::ComponentAlreadyProvided {
                    name: self.name().to_string(),
                });
            }
            *guard = Some(component.clone());
        }
        if component.instantiation_mode() == InstantiationMode::Eager {
            self.get_or_initialize()?;
        }
        Ok(())
    }

    /// Registers a ready-made instance in place of a factory.
    pub(crate) fn set_instance(&self, service: DynService) -> Result<(), ComponentError> {
        let has_factory = self.is_component_set();
        let mut guard = self.inner.instance.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() || has_factory {
            return Err(ComponentError::ComponentAlreadyProvided {
                name: self.name().to_string(),
            });
        }
        *guard = Some(service);
        Ok(())
    }

    pub fn get<T>(&self) -> Result<Arc<T>, ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        self.get_or_initialize()?
            .downcast::<T>()
            .map_err(|_| ComponentError::InstanceUnavailable {
                name: self.name().to_string(),
            })
    }

    fn get_or_initialize(&self) -> Result<DynService, ComponentError> {
        if let Some(instance) = self
            .inner
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(instance.clone());
        }

        let component = self.component().ok_or_else(|| ComponentError::ComponentNotRegistered {
            name: self.name().to_string(),
        })?;
        let container = self
            .inner
            .container
            .upgrade()
            .map(|inner| ComponentContainer { inner })
            .ok_or_else(|| ComponentError::InitializationFailed {
                name: self.name().to_string(),
                reason: "container dropped".into(),
            })?;

        if self.inner.initializing.swap(true, Ordering::SeqCst) {
            return Err(ComponentError::CircularDependency {
                name: self.name().to_string(),
            });
        }
        let result = (component.instance_factory)(&container);
        self.inner.initializing.store(false, Ordering::SeqCst);

        let instance = result.map_err(|err| ComponentError::InitializationFailed {
            name: self.name().to_string(),
            reason: err.to_string(),
        })?;
        let mut guard = self.inner.instance.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get_or_insert(instance).clone())
    }

    /// Drops the live instance, running the component's teardown hook first.
    pub(crate) fn teardown(&self) {
        let instance = self
            .inner
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(instance), Some(component)) = (instance, self.component()) {
            if let Some(callback) = component.on_teardown.as_ref() {
                callback(&instance);
            }
        }
    }
}
