#![doc = include_str!("RUSTDOC.md")]

pub mod app;
pub mod auth;
pub mod component;
pub mod firestore;
pub mod logger;
pub mod platform;
pub mod util;
