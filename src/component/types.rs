use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::component::container::ComponentContainer;

pub type DynService = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstantiationMode {
    /// Built on first lookup.
    Lazy,
    /// Built as soon as the component is registered.
    Eager,
}

pub type InstanceFactory = Arc<dyn Fn(&ComponentContainer) -> Result<DynService, ComponentError> + Send + Sync>;
pub type TeardownCallback = Arc<dyn Fn(&DynService) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    ComponentAlreadyProvided { name: String },
    ComponentNotRegistered { name: String },
    InitializationFailed { name: String, reason: String },
    InstanceUnavailable { name: String },
    CircularDependency { name: String },
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::ComponentAlreadyProvided { name } => {
                write!(f, "Component {name} has already been registered")
            }
            ComponentError::ComponentNotRegistered { name } => {
                write!(f, "Component {name} has not been registered yet")
            }
            ComponentError::InitializationFailed { name, reason } => {
                write!(f, "Component {name} failed to initialize: {reason}")
            }
            ComponentError::InstanceUnavailable { name } => {
                write!(f, "Service {name} is not available with the requested type")
            }
            ComponentError::CircularDependency { name } => {
                write!(f, "Component {name} depends on itself while initializing")
            }
        }
    }
}

impl std::error::Error for ComponentError {}
