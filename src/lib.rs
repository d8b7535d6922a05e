pub mod admin_handlers;
pub mod app;
pub mod auth;
pub mod binder;
pub mod catalog;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod functions;
pub mod handlers;
pub mod latency;
pub mod loader;
pub mod models;
pub mod normalizer;
pub mod payload;
pub mod pipes;
pub mod registry;
pub mod tools;
