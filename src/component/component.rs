use std::sync::Arc;

use crate::component::container::ComponentContainer;
use crate::component::types::{ComponentError, DynService, InstanceFactory, InstantiationMode, TeardownCallback};

#[derive(Clone)]
pub struct Component {
    name: Arc<str>,
    pub(crate) instance_factory: InstanceFactory,
    pub(crate) instantiation_mode: InstantiationMode,
    pub(crate) on_teardown: Option<TeardownCallback>,
}

impl Component {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ComponentContainer) -> Result<DynService, ComponentError> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            instance_factory: Arc::new(factory),
            instantiation_mode: InstantiationMode::Lazy,
            on_teardown: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiation_mode(&self) -> InstantiationMode {
        self.instantiation_mode
    }

    pub fn with_instantiation_mode(mut self, mode: InstantiationMode) -> Self {
        self.instantiation_mode = mode;
        self
    }

    /// Runs when the owning container is torn down with an instance alive.
    pub fn with_teardown<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DynService) + Send + Sync + 'static,
    {
        self.on_teardown = Some(Arc::new(callback));
        self
    }
}
