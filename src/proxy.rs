mod cache;
mod direct;
mod materialize;
mod response;
mod types;


use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use gorelay_adapter::FilesystemStorage;
use rama::{
    Service,
    error::BoxError,
    http::{Body, Method, Request, Response, StatusCode},
};
use tracing::{debug, error, info, warn};

use crate::{config::Config, exclude::ExclusionSet, store::ModuleStore, upstream::UpstreamClient};

pub use materialize::{CacheWrite, Materialized, ResponseMaterializer};
pub use types::{
    CacheStatus, Freshness, ModuleRequest, Operation, PathError, RequestContext, Route,
};

/// Routes module proxy requests between the module store, the download
/// cache and the upstream proxy.
pub struct ModProxy<S> {
    storage: Arc<FilesystemStorage>,
    store: Arc<S>,
    upstream: Option<UpstreamClient>,
    materializer: ResponseMaterializer,
    exclude: Arc<ExclusionSet>,
    list_ttl: Duration,
}

impl<S> Clone for ModProxy<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            store: self.store.clone(),
            upstream: self.upstream.clone(),
            materializer: self.materializer.clone(),
            exclude: self.exclude.clone(),
            list_ttl: self.list_ttl,
        }
    }
}

impl<S: ModuleStore> ModProxy<S> {
    pub fn new(
        storage: Arc<FilesystemStorage>,
        store: Arc<S>,
        upstream: Option<UpstreamClient>,
        exclude: ExclusionSet,
        list_ttl: Duration,
    ) -> Self {
        Self {
            materializer: ResponseMaterializer::new(storage.clone()),
            storage,
            store,
            upstream,
            exclude: Arc::new(exclude),
            list_ttl,
        }
    }

    pub fn from_config(
        config: &Config,
        storage: Arc<FilesystemStorage>,
        store: Arc<S>,
    ) -> Result<Self> {
        let upstream = match config.active_upstream() {
            Some(upstream_config) => {
                let client =
                    UpstreamClient::new(upstream_config).context("building upstream client")?;
                info!(upstream = %client.base(), "forwarding public modules upstream");
                Some(client)
            }
            None => {
                info!("No upstream configured - serving every module direct");
                None
            }
        };

        let exclude = ExclusionSet::parse(&config.routing.exclude);
        if !exclude.is_empty() {
            info!(exclude = exclude.as_str(), "excluded modules are served direct");
        }

        Ok(Self::new(
            storage,
            store,
            upstream,
            exclude,
            config.storage.list_ttl(),
        ))
    }

    /// Chooses how to answer a classified request.
    pub async fn decide(&self, request: &ModuleRequest) -> Route {
        if self.upstream.is_none() || self.exclude.matches(&request.module) {
            return Route::Direct;
        }

        let modified = match self.storage.stat(&request.key).await {
            Ok(modified) => modified,
            Err(err) => {
                warn!(key = %request.key, error = %err, "cache stat failed, forwarding");
                None
            }
        };
        cache::cache_route(
            modified,
            request.operation.freshness(),
            SystemTime::now(),
            self.list_ttl,
        )
    }

    async fn handle(&self, req: Request<Body>, ctx: &mut RequestContext) -> Result<Response<Body>> {
        let head_only = req.method() == Method::HEAD;
        if !head_only && req.method() != Method::GET {
            ctx.cache = CacheStatus::Rejected;
            return response::respond_method_not_allowed();
        }

        let request = match ModuleRequest::from_path(req.uri().path()) {
            Ok(request) => request,
            Err(err) => {
                ctx.cache = CacheStatus::Rejected;
                debug!(error = %err, "rejecting request");
                return response::respond_text(StatusCode::NOT_FOUND, "not found");
            }
        };

        match self.decide(&request).await {
            Route::Direct => {
                ctx.cache = CacheStatus::Direct;
                direct::serve_direct(self.store.as_ref(), &request, head_only).await
            }
            Route::CachedFresh { modified } => {
                let cached = cache::serve_cached(
                    &self.storage,
                    &request,
                    modified,
                    req.headers(),
                    head_only,
                )
                .await;
                match cached {
                    Ok(Some(resp)) => {
                        ctx.cache = CacheStatus::Hit;
                        Ok(resp)
                    }
                    Ok(None) => {
                        debug!(key = %request.key, "cache entry vanished, forwarding");
                        self.forward(&req, &request, false, head_only, ctx).await
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            key = %request.key,
                            "failed to serve cached entry, falling back to upstream"
                        );
                        self.forward(&req, &request, false, head_only, ctx).await
                    }
                }
            }
            Route::Forward { stale } => self.forward(&req, &request, stale, head_only, ctx).await,
        }
    }

    async fn forward(
        &self,
        req: &Request<Body>,
        request: &ModuleRequest,
        stale: bool,
        head_only: bool,
        ctx: &mut RequestContext,
    ) -> Result<Response<Body>> {
        let Some(client) = &self.upstream else {
            ctx.cache = CacheStatus::Direct;
            return direct::serve_direct(self.store.as_ref(), request, head_only).await;
        };

        let upstream = match client
            .get(req.uri().path(), req.uri().query(), req.headers())
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                ctx.cache = CacheStatus::Error;
                error!(
                    error = %err,
                    summary = %ctx.summary(),
                    "failed to proxy request to upstream"
                );
                return response::respond_text(StatusCode::BAD_GATEWAY, "upstream error");
            }
        };

        let materialized = self.materializer.materialize(&request.key, upstream).await;
        debug!(
            key = %request.key,
            outcome = ?materialized.outcome,
            "forwarded response materialized"
        );
        ctx.cache = if stale {
            CacheStatus::Stale
        } else {
            CacheStatus::Miss
        };
        response::respond_materialized(materialized, head_only)
    }
}

impl<S: ModuleStore> Service<Request<Body>> for ModProxy<S> {
    type Output = Response<Body>;
    type Error = BoxError;

    async fn serve(&self, req: Request<Body>) -> Result<Self::Output, Self::Error> {
        let mut ctx = RequestContext::from_request(&req);

        let result = self.handle(req, &mut ctx).await;

        match &result {
            Ok(resp) => {
                let response_code = resp.status().as_u16();
                let duration_ms = ctx.start.elapsed().as_millis();
                info!(
                    method = %ctx.method,
                    path = %ctx.path,
                    response_code,
                    duration_ms,
                    cache_status = %ctx.cache,
                    "request handled"
                );
            }
            Err(err) => {
                let duration_ms = ctx.start.elapsed().as_millis();
                error!(
                    summary = %ctx.summary(),
                    duration_ms,
                    cache_status = %CacheStatus::Error,
                    error = %err,
                    "request failed"
                );
            }
        }

        result.map_err(|e| e.into())
    }
}
