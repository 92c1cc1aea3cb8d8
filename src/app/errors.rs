use std::fmt;

use crate::component::ComponentError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    BadAppName { app_name: String },
    AppDeleted { app_name: String },
    ComponentFailure { component: String, message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadAppName { app_name } => write!(f, "Illegal App name: '{app_name}'"),
            AppError::AppDeleted { app_name } => write!(f, "App named '{app_name}' already deleted"),
            AppError::ComponentFailure { component, message } => {
                write!(f, "Component {component} error: {message}")
            }
        }
    }
}

impl std::error::Error for AppError {}

impl From<ComponentError> for AppError {
    fn from(err: ComponentError) -> Self {
        let component = match &err {
            ComponentError::ComponentAlreadyProvided { name }
            | ComponentError::ComponentNotRegistered { name }
            | ComponentError::InitializationFailed { name, .. }
            | ComponentError::InstanceUnavailable { name }
            | ComponentError::CircularDependency { name } => name.clone(),
        };
        AppError::ComponentFailure {
            component,
            message: err.to_string(),
        }
    }
}
