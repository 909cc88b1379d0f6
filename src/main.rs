#![warn(
    rust_2024_compatibility,
    clippy::all,
    clippy::future_not_send,
    clippy::mod_module_files,
    clippy::needless_pass_by_ref_mut,
    clippy::unused_async
)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
use rama::{
    Layer as RamaLayer,
    graceful::Shutdown,
    http::{layer::trace::TraceLayer, server::HttpServer},
    layer::ConsumeErrLayer,
    rt::Executor,
    tcp::server::TcpListener,
};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use gorelay::{
    config::{Config, DEFAULT_CONFIG_FILE, Overrides, StorageConfig},
    exclude::ExclusionSet,
    proxy::ModProxy,
    store::{GoCommandStore, GoToolchain, detect_gopath},
};
use gorelay_adapter::FilesystemStorage;

#[derive(Debug, Parser)]
#[command(author, version, about = "Caching Go module proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy server
    Serve {
        /// Path to the configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Address to listen on (host:port)
        #[arg(long)]
        listen: Option<String>,
        /// GOPATH whose module download cache backs the proxy
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Upstream module proxy; pass an empty string to serve everything direct
        #[arg(long)]
        proxy: Option<String>,
        /// Comma-separated module path globs that are never forwarded
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Show which module paths an exclusion list routes direct
    CheckExclude {
        /// Comma-separated module path globs
        #[arg(long)]
        exclude: String,
        /// Module paths to test
        #[arg(required = true)]
        modules: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            listen,
            cache,
            proxy,
            exclude,
        } => run_server(
            config,
            Overrides {
                listen,
                cache,
                proxy,
                exclude,
            },
        ),
        Command::CheckExclude { exclude, modules } => {
            run_check_exclude(&exclude, &modules);
            Ok(())
        }
    }
}

fn run_server(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let mut config = Config::load(Some(config_path)).context("loading configuration")?;
    config
        .apply_overrides(overrides)
        .context("applying command line overrides")?;
    config.validate().context("validating configuration")?;
    init_tracing(&config)?;
    let config = Arc::new(config);

    let rt_server = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .enable_all()
        .build()
        .context("constructing server runtime")?;

    rt_server.block_on(async move {
        let gopath = match &config.storage.gopath {
            Some(gopath) => gopath.clone(),
            None => detect_gopath(&config.toolchain.go)
                .await
                .context("detecting GOPATH; set storage.gopath or pass --cache")?,
        };
        let storage = FilesystemStorage::new(StorageConfig::download_root(&gopath));
        storage
            .prepare()
            .await
            .context("preparing module download cache")?;
        tracing::info!(
            gopath = %gopath.display(),
            download_root = %storage.root().display(),
            "module cache ready"
        );

        let exclude = ExclusionSet::parse(&config.routing.exclude);
        let toolchain = GoToolchain::from_config(&config.toolchain, gopath, &exclude);
        let store = GoCommandStore::new(toolchain, storage.clone(), config.storage.list_ttl());
        let proxy = ModProxy::from_config(&config, Arc::new(storage), Arc::new(store))
            .context("creating proxy service")?;

        let addr = config.server.listen_addr();
        let tcp_service = TcpListener::build()
            .bind(addr.clone())
            .await
            .map_err(|err| anyhow!("binding {addr}: {err}"))?;
        tracing::info!(%addr, "starting Rama HTTP server");

        let graceful = Shutdown::new(shutdown_signal());
        graceful.spawn_task_fn(move |guard| async move {
            let exec = Executor::graceful(guard.clone());
            let http_service = HttpServer::auto(exec).service(
                (TraceLayer::new_for_http(), ConsumeErrLayer::default()).into_layer(proxy),
            );
            tcp_service.serve_graceful(guard, http_service).await;
        });

        let elapsed = graceful
            .shutdown_with_limit(Duration::from_secs(config.server.shutdown_grace_secs))
            .await
            .context("graceful shutdown")?;
        tracing::info!(elapsed_ms = elapsed.as_millis(), "server stopped");

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM, waiting for ctrl+c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}

fn run_check_exclude(exclude: &str, modules: &[String]) {
    let set = ExclusionSet::parse(exclude);
    for module in modules {
        let route = if set.matches(module) { "direct" } else { "proxy" };
        println!("{module}\t{route}");
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .context("building log filter")?;

    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some(endpoint) = config.logging.otlp_endpoint() {
        use opentelemetry_otlp::WithExportConfig;

        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "gorelay"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;

        let provider = sdktrace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer("gorelay");
        global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}
