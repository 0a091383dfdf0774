//! Server assembly: configuration, listener setup and the accept/event loop.

mod config;
mod event_loop;
mod listener;

pub use config::{ConfigError, DEFAULT_BACKLOG, ServerConfig, ServerConfigBuilder, TlsOptions};
pub use event_loop::{Server, ServerHandle};
