mod errors;
mod types;

#[doc(inline)]
pub use errors::{AppError, AppResult};

#[doc(inline)]
pub use types::{App, AppOptions, APP_OPTIONS_COMPONENT, DEFAULT_APP_NAME};
