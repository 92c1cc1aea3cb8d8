pub mod backoff;

pub use backoff::{BackoffConfig, ExponentialBackoff};
