use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::component::{Component, ComponentContainer};

/// Name under which [`AppOptions`] is available from the app's container.
pub const APP_OPTIONS_COMPONENT: &str = "app-options";

pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppOptions {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    /// Database within the project. `None` selects the default database.
    pub database_id: Option<String>,
    pub app_id: Option<String>,
}

/// An application handle owning its own component container.
///
/// Apps are plain values: create as many as needed, nothing is registered
/// in process-wide state.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    name: Arc<str>,
    options: AppOptions,
    is_deleted: AtomicBool,
    container: ComponentContainer,
}

impl App {
    pub fn new(name: impl Into<String>, options: AppOptions) -> AppResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AppError::BadAppName { app_name: name });
        }
        let container = ComponentContainer::new(name.clone());
        container.provide_instance(APP_OPTIONS_COMPONENT, Arc::new(options.clone()))?;
        Ok(Self {
            inner: Arc::new(AppInner {
                name: Arc::from(name),
                options,
                is_deleted: AtomicBool::new(false),
                container,
            }),
        })
    }

    pub fn with_default_name(options: AppOptions) -> AppResult<Self> {
        Self::new(DEFAULT_APP_NAME, options)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &AppOptions {
        &self.inner.options
    }

    pub fn container(&self) -> ComponentContainer {
        self.inner.container.clone()
    }

    pub fn add_component(&self, component: Component) -> AppResult<()> {
        self.check_destroyed()?;
        self.inner.container.add_component(component).map_err(AppError::from)
    }

    pub fn add_or_overwrite_component(&self, component: Component) -> AppResult<()> {
        self.check_destroyed()?;
        self.inner
            .container
            .add_or_overwrite_component(component)
            .map_err(AppError::from)
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.is_deleted.load(Ordering::SeqCst)
    }

    pub fn check_destroyed(&self) -> AppResult<()> {
        if self.is_deleted() {
            return Err(AppError::AppDeleted {
                app_name: self.name().to_owned(),
            });
        }
        Ok(())
    }

    /// Tears down every service created for this app. Idempotent.
    pub fn delete(&self) {
        if self.inner.is_deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.container.teardown();
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
