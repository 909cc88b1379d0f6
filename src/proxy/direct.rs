use anyhow::Result;
use bytes::Bytes;
use rama::http::{Body, Response, StatusCode};
use tracing::{error, info};

use super::{
    response,
    types::{ModuleRequest, Operation},
};
use crate::store::{ModuleStore, StoreError};

/// Answers a request from the authoritative store. Nothing is cached here;
/// the store owns its own on-disk state.
pub async fn serve_direct<S: ModuleStore>(
    store: &S,
    request: &ModuleRequest,
    head_only: bool,
) -> Result<Response<Body>> {
    let module = request.module.as_str();
    let result = match &request.operation {
        Operation::List => store.list_versions(module).await,
        Operation::Latest => store.latest(module).await,
        Operation::Info(version) => store.info(module, version).await,
        Operation::Mod(version) => store.manifest(module, version).await,
        Operation::Zip(version) => store.archive(module, version).await,
    };

    match result {
        Ok(data) => response::respond_bytes(
            request.operation.direct_content_type(),
            Bytes::from(data),
            head_only,
        ),
        Err(StoreError::NotFound(message)) => {
            info!(
                module,
                operation = request.operation.name(),
                %message,
                "module not found in store"
            );
            response::respond_text(StatusCode::NOT_FOUND, &format!("not found: {message}"))
        }
        Err(err) => {
            error!(
                module,
                operation = request.operation.name(),
                error = %err,
                "module store failed"
            );
            response::respond_text(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}
