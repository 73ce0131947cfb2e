mod agent;
mod collectors;
mod config;
mod dispatch;
mod http;
mod metrics;
mod rpc;
mod snapshot;
mod state;

use agent::Agent;
use axum::serve;
use clap::Parser;
use config::Config;
use dispatch::{CallTimeouts, ConsoleSink, Dispatcher, Registration, ReportSink};
use metrics::Metrics;
use rpc::GrpcSink;
use snapshot::now_unix;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "telemetryd")]
#[command(version, about = "Host telemetry agent")]
struct Cli {
    #[arg(long, default_value = "./agent-config.yaml")]
    config: String,
    /// Collection server address (host:port); overrides the config file.
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    host_id: Option<String>,
    /// Collection interval in seconds.
    #[arg(long)]
    interval: Option<u64>,
    /// Print reports to stdout instead of sending them.
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    print_default_config: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(server) = &self.server {
            cfg.server_addr = server.clone();
        }
        if let Some(host_id) = &self.host_id {
            cfg.host_id = host_id.clone();
        }
        if let Some(interval) = self.interval {
            cfg.interval_secs = interval;
        }
        if self.debug {
            cfg.debug = true;
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_or_default(&cli.config) {
        Ok((cfg, true)) => cfg,
        Ok((cfg, false)) => {
            warn!(path = %cli.config, "config file not found, using defaults");
            cfg
        }
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    cli.apply(&mut cfg);
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    info!(
        host_id = %cfg.host_id,
        server = %cfg.server_addr,
        interval_secs = cfg.interval_secs,
        heartbeat_interval_secs = cfg.heartbeat_interval_secs,
        debug = cfg.is_debug(),
        "starting telemetryd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };
    let shared_state = Arc::new(RwLock::new(State::new(cfg.host_id.clone(), now_unix())));

    let dispatcher = match build_dispatcher(&cfg, metrics.clone()).await {
        Ok(d) => d,
        Err(err) => {
            error!(error = %err, server = %cfg.server_addr, "failed to connect to collection server");
            std::process::exit(1);
        }
    };
    shared_state.write().await.registered = dispatcher.is_registered();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(dispatch::QUEUE_CAPACITY);

    let worker_task =
        dispatch::spawn_worker(dispatcher, rx, shared_state.clone(), shutdown_rx.clone());

    let http_task = cfg
        .listen
        .clone()
        .map(|listen| spawn_http(listen, metrics.clone(), shared_state.clone(), shutdown_rx.clone()));

    let collector_task = {
        let agent = Agent::new(
            cfg.host_id.clone(),
            collectors::build_collectors(&cfg),
            metrics.clone(),
            shared_state.clone(),
            tx.clone(),
        );
        let interval = Duration::from_secs(cfg.interval_secs);
        tokio::spawn(agent.run_collection(interval, shutdown_rx.clone()))
    };

    let heartbeat_task = tokio::spawn(agent::run_heartbeat(
        Duration::from_secs(cfg.heartbeat_interval_secs),
        tx,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    let _ = heartbeat_task.await;
    let _ = worker_task.await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
}

async fn build_dispatcher(
    cfg: &Config,
    metrics: Arc<Metrics>,
) -> Result<Dispatcher, dispatch::DispatchError> {
    let timeouts = CallTimeouts::from(&cfg.timeouts);

    if cfg.is_debug() {
        info!("debug mode, reports go to stdout");
        let sink: Box<dyn ReportSink> = Box::new(ConsoleSink);
        let mut dispatcher = Dispatcher::new(sink, cfg.host_id.clone(), timeouts, metrics);
        dispatcher.skip_registration();
        return Ok(dispatcher);
    }

    let connect_timeout = Duration::from_secs(cfg.timeouts.connect_secs);
    let sink = GrpcSink::connect(&cfg.server_addr, connect_timeout).await?;
    info!(server = %cfg.server_addr, "connected to collection server");

    let mut dispatcher = Dispatcher::new(Box::new(sink), cfg.host_id.clone(), timeouts, metrics);
    let registration = Registration::detect(cfg).await;
    dispatcher.register(&registration).await?;
    Ok(dispatcher)
}

fn spawn_http(
    listen: String,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = http::build_router(metrics, state);
        let addr: SocketAddr = match listen.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(error = %err, listen = %listen, "invalid listen address");
                return;
            }
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                error!(error = %err, listen = %listen, "failed to start HTTP server");
                return;
            }
        };
        info!(listen = %addr, "HTTP server listening");

        let server = serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });

        if let Err(err) = server.await {
            error!(error = %err, "HTTP server error");
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
