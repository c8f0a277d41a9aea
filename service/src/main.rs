use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use textproc_core::config::AppConfig;
use textproc_core::logging;
use textproc_core::TaskStore;
use textproc_producer::{Producer, ProducerConfig};

mod auth;
mod ingress;
mod migrate;
mod worker_cmd;
mod worker_process_cmd;

#[derive(Parser, Debug)]
#[command(name = "textproc-service")]
#[command(about = "Asynchronous text-processing pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations.
    Migrate,
    /// Run the HTTP ingress service (C5).
    Ingress,
    /// Run the worker service: Consumer (C3) + worker-process pool (C8).
    Worker,
    /// Internal worker-process pool entrypoint (C8); re-exec'd by `worker`.
    WorkerProcess,
}

#[derive(Clone)]
pub struct AppState {
    pub config: std::sync::Arc<AppConfig>,
    pub store: TaskStore,
    pub producer: std::sync::Arc<Producer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::from_env().context("load configuration")?;

    if matches!(cli.command, Command::WorkerProcess) {
        logging::init_stderr_only(&cfg.log_level);
    } else {
        logging::init(&cfg.log_level, cfg.log_fmt, cfg.log_record_max_len);
    }

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Ingress => run_ingress(&cfg).await,
        Command::Worker => worker_cmd::run(&cfg).await,
        Command::WorkerProcess => worker_process_cmd::run(&cfg).await,
    }
}

async fn run_ingress(cfg: &AppConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect to database")?;
    let store = TaskStore::new(pool);

    let producer = Producer::new(ProducerConfig {
        amqp_uri: cfg.rabbitmq_uri.clone(),
        exchange: cfg.rabbitmq_exchange.clone(),
        queue: cfg.rabbitmq_queue.clone(),
        routing_key: cfg.rabbitmq_routing_key.clone(),
        app_name: cfg.app_name.clone(),
    });
    producer.startup().await.context("start producer")?;
    let producer = std::sync::Arc::new(producer);

    let state = AppState {
        config: std::sync::Arc::new(cfg.clone()),
        store,
        producer: producer.clone(),
    };

    let app = ingress::router(state);
    let listener = tokio::net::TcpListener::bind((cfg.web_api_host.as_str(), cfg.web_api_port))
        .await
        .with_context(|| format!("bind {}:{}", cfg.web_api_host, cfg.web_api_port))?;

    tracing::info!(event = "ingress.start", addr = %listener.local_addr()?, "starting ingress service");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve ingress")?;

    producer.shutdown().await.ok();
    tracing::info!(event = "ingress.stopped", "ingress service stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
