//! Server configuration.
//!
//! All knobs are immutable inputs at construction: listen address, backlog,
//! worker count and the optional TLS certificate/key file pair. Sockets are
//! unconditionally non-blocking in this engine, so there is no flag for it.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Default backlog for the listening socket.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Certificate/key file pair enabling TLS termination.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Immutable server configuration, created through [`ServerConfig::builder`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) addr: SocketAddr,
    pub(crate) backlog: u32,
    pub(crate) workers: usize,
    pub(crate) tls: Option<TlsOptions>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("listen address must be set")]
    MissingAddress,
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    addr: Option<SocketAddr>,
    backlog: Option<u32>,
    workers: Option<usize>,
    tls: Option<TlsOptions>,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Listen address. Port 0 binds an ephemeral port, reported through
    /// [`ServerHandle::local_addr`](crate::server::ServerHandle::local_addr).
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Maximum number of pending not-yet-accepted connections.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Worker-thread count; zero is clamped to one. Defaults to the
    /// machine's available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Enables TLS termination with the given PEM certificate chain and
    /// private key files.
    pub fn tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsOptions { cert_path: cert_path.into(), key_path: key_path.into() });
        self
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let addr = self.addr.ok_or(ConfigError::MissingAddress)?;
        let workers = self.workers.unwrap_or_else(default_workers).max(1);
        Ok(ServerConfig { addr, backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG), workers, tls: self.tls })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).build().unwrap();
        assert_eq!(config.backlog(), DEFAULT_BACKLOG);
        assert!(config.workers() >= 1);
        assert!(config.tls().is_none());
    }

    #[test]
    fn test_missing_address() {
        let err = ServerConfig::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingAddress));
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config =
            ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(0).build().unwrap();
        assert_eq!(config.workers(), 1);
    }

    #[test]
    fn test_tls_paths() {
        let config = ServerConfig::builder()
            .address("0.0.0.0:8443".parse().unwrap())
            .tls("/opt/chat/crt.crt", "/opt/chat/key.key")
            .build()
            .unwrap();
        let tls = config.tls().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("/opt/chat/crt.crt"));
        assert_eq!(tls.key_path, PathBuf::from("/opt/chat/key.key"));
    }
}
