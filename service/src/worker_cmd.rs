//! `worker` subcommand: runs the Consumer (C3) wired to the worker-process pool (C8).

use textproc_consumer::{Consumer, ConsumerConfig};
use textproc_core::config::AppConfig;

pub async fn run(cfg: &AppConfig) -> anyhow::Result<()> {
    let workers_num = cfg.workers_num();
    let prefetch_count = cfg.prefetch_count();

    tracing::info!(
        event = "worker.start",
        workers_num,
        prefetch_count,
        "starting worker service"
    );

    let consumer_config = ConsumerConfig {
        amqp_uri: cfg.rabbitmq_uri.clone(),
        exchange: cfg.rabbitmq_exchange.clone(),
        queue: cfg.rabbitmq_queue.clone(),
        routing_key: cfg.rabbitmq_routing_key.clone(),
        workers_num,
        prefetch_count,
        graceful_shutdown: true,
        max_redelivery: cfg.consumer_max_redelivery,
        worker_program: std::env::current_exe()?.into_os_string(),
        worker_program_args: vec!["worker-process".to_string()],
    };

    let consumer = Consumer::new(consumer_config);
    consumer.startup().await?;
    consumer.run().await?;

    tracing::info!(event = "worker.stopped", "worker service stopped cleanly");
    Ok(())
}
