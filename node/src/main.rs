use axum::{routing::get, serve, Extension, Router};
use blockflow_ingest::Engine;
use blockflow_node::{config::Config, rpc::RpcClient, store::Store, Error};
use clap::{value_parser, Arg, Command};
use commonware_runtime::{tokio as tokio_runtime, Metrics, Runner, Spawner};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse arguments
    let matches = Command::new("blockflow")
        .about("ingest blocks from JSON-RPC sources in strict order")
        .arg(
            Arg::new("config")
                .long("config")
                .required(true)
                .help("Path to the YAML configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log filter (overrides the configuration file)"),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .value_parser(value_parser!(u16))
                .help("Port to serve metrics on (overrides the configuration file)"),
        )
        .get_matches();

    // Load config
    let path = matches.get_one::<String>("config").unwrap();
    let mut config = Config::load(path).unwrap_or_else(|err| {
        eprintln!("failed to load {path}: {err}");
        std::process::exit(1);
    });
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }
    if let Some(port) = matches.get_one::<u16>("metrics-port") {
        config.metrics_port = Some(*port);
    }

    // Create logger
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| {
        eprintln!("{}", Error::InvalidLogLevel(config.log_level.clone()));
        std::process::exit(1);
    });
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_line_number(true)
            .with_file(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!(
        sources = config.sources.len(),
        genesis = config.genesis,
        storage_dir = %config.storage_dir.display(),
        partition = %config.partition,
        metrics_port = ?config.metrics_port,
        "loaded config"
    );

    // Start runtime
    let runtime_cfg =
        tokio_runtime::Config::default().with_storage_directory(config.storage_dir.clone());
    let executor = tokio_runtime::Runner::new(runtime_cfg);
    let result = executor.start(|context| async move { run(context, config).await });
    if let Err(err) = result {
        error!(%err, "ingestion stopped");
        std::process::exit(1);
    }
}

async fn run(context: tokio_runtime::Context, config: Config) -> Result<(), Error> {
    if let Some(port) = config.metrics_port {
        serve_metrics(context.with_label("metrics"), port);
    }

    // Initialize collaborators
    let cfg = config.ingest();
    let client = RpcClient::new(cfg.request_timeout)?;
    let store = Store::init(context.with_label("store"), &config.partition).await?;

    // Run until a fatal error
    let engine = Engine::new(context.with_label("ingest"), cfg, client, store)?;
    engine.start().await??;
    Ok(())
}

fn serve_metrics(context: tokio_runtime::Context, port: u16) {
    context.spawn(move |context| async move {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(?err, port, "could not bind metrics address");
                return;
            }
        };
        info!(port, "serving metrics");
        let app = Router::new()
            .route(
                "/metrics",
                get(|extension: Extension<tokio_runtime::Context>| async move {
                    extension.0.encode()
                }),
            )
            .layer(Extension(context));
        if let Err(err) = serve(listener, app.into_make_service()).await {
            error!(?err, "could not serve metrics");
        }
    });
}
