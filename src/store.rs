//! The authoritative module store consulted for direct routing.

pub mod gocmd;

use std::future::Future;

use thiserror::Error;

pub use gocmd::{GoCommandStore, GoToolchain, detect_gopath};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{command}: {message}")]
    Command { command: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves modules the proxy owns. Module paths and versions are passed
/// unescaped; every operation returns the raw protocol bytes.
pub trait ModuleStore: Send + Sync + 'static {
    fn list_versions(
        &self,
        module: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn latest(&self, module: &str) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn info(
        &self,
        module: &str,
        version: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn manifest(
        &self,
        module: &str,
        version: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn archive(
        &self,
        module: &str,
        version: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;
}
