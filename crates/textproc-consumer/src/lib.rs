//! Consumer (C3): the heart of the core. Declares broker topology, receives under
//! a bounded prefetch window, dispatches each delivery to a worker-pool slot, and
//! acks/nacks/rejects per outcome while coordinating graceful shutdown.

pub mod pool;

use futures_lite::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use pool::{JobOutcome, WorkerPool};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub amqp_uri: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub workers_num: usize,
    pub prefetch_count: u16,
    pub graceful_shutdown: bool,
    pub max_redelivery: Option<u32>,
    /// Program + args used to re-exec this binary's worker-process entrypoint,
    /// e.g. `(current_exe(), vec!["worker-process"])`.
    pub worker_program: std::ffi::OsString,
    pub worker_program_args: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer already started")]
    AlreadyStarted,
    #[error("consumer not started")]
    NotStarted,
    #[error("consumer not running")]
    NotRunning,
    #[error("consumer already shut down")]
    AlreadyShutDown,
    #[error("amqp transport error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("worker pool error: {0}")]
    Pool(#[from] pool::PoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Running,
    Draining,
    Stopped,
}

struct Started {
    connection: Connection,
    channel: Channel,
    pool: Arc<WorkerPool>,
    semaphore: Arc<Semaphore>,
}

/// Consumer state machine (§4.3): `Created → Started → Running → Draining → Stopped`.
/// Double-start and double-shutdown are both rejected with a fatal error.
pub struct Consumer {
    config: ConsumerConfig,
    phase: std::sync::Mutex<Phase>,
    started: tokio::sync::Mutex<Option<Started>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    in_flight: Arc<std::sync::Mutex<JoinSet<()>>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            phase: std::sync::Mutex::new(Phase::Created),
            started: tokio::sync::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            in_flight: Arc::new(std::sync::Mutex::new(JoinSet::new())),
        }
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), ConsumerError> {
        let mut phase = self.phase.lock().unwrap();
        if *phase != from {
            return Err(match to {
                Phase::Started => ConsumerError::AlreadyStarted,
                Phase::Running => ConsumerError::NotStarted,
                Phase::Stopped if *phase == Phase::Stopped => ConsumerError::AlreadyShutDown,
                _ => ConsumerError::NotRunning,
            });
        }
        *phase = to;
        Ok(())
    }

    /// Declares topology (idempotent), sets QoS, pre-forks the worker-process
    /// pool, and arms the shutdown signal handlers if `graceful_shutdown`.
    pub async fn startup(&self) -> Result<(), ConsumerError> {
        self.transition(Phase::Created, Phase::Started)?;

        let connection =
            Connection::connect(&self.config.amqp_uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                &self.config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await?;

        let pool = WorkerPool::spawn(
            self.config.worker_program.clone(),
            self.config.worker_program_args.clone(),
            self.config.workers_num,
        )
        .await?;

        // `workers_num + 1` permits: one message may be "in flight toward" the
        // pool queue beyond the workers actually executing.
        let semaphore = Arc::new(Semaphore::new(self.config.workers_num + 1));

        if self.config.graceful_shutdown {
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                let ctrl_c = tokio::signal::ctrl_c();
                #[cfg(unix)]
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                #[cfg(unix)]
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
                #[cfg(not(unix))]
                {
                    let _ = ctrl_c.await;
                }
                let _ = shutdown_tx.send(true);
            });
        }

        *self.started.lock().await = Some(Started {
            connection,
            channel,
            pool: Arc::new(pool),
            semaphore,
        });
        Ok(())
    }

    /// Begins consuming; each delivery is dispatched to its own task without
    /// blocking the receive loop. Returns once the shutdown signal fires and the
    /// full drain sequence (§5) has completed.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        self.transition(Phase::Started, Phase::Running)?;

        let started_guard = self.started.lock().await;
        let started = started_guard.as_ref().ok_or(ConsumerError::NotStarted)?;
        let channel = started.channel.clone();
        let pool = started.pool.clone();
        let semaphore = started.semaphore.clone();
        drop(started_guard);

        let consumer_tag = format!("textproc-consumer-{}", uuid::Uuid::new_v4().simple());
        let mut stream = channel
            .basic_consume(
                &self.config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let max_redelivery = self.config.max_redelivery;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    let Some(delivery) = next else { break };
                    let Ok(delivery) = delivery else { continue };

                    let pool = pool.clone();
                    let semaphore = semaphore.clone();

                    self.in_flight.lock().unwrap().spawn(async move {
                        handle_delivery(delivery, pool, semaphore, max_redelivery).await;
                    });
                }
            }
        }

        self.transition(Phase::Running, Phase::Draining)?;
        channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await?;

        let mut in_flight = {
            let mut guard = self.in_flight.lock().unwrap();
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        while in_flight.join_next().await.is_some() {}

        let mut started_guard = self.started.lock().await;
        if let Some(started) = started_guard.take() {
            // Every handler task held a clone of this Arc; all have joined above,
            // so this is the last reference and the unwrap cannot fail.
            match Arc::try_unwrap(started.pool) {
                Ok(pool) => pool.drain(std::time::Duration::from_secs(30)).await,
                Err(_) => tracing::warn!(
                    event = "consumer.pool.shared_at_drain",
                    "pool still referenced after draining in-flight handlers"
                ),
            }
            started.channel.close(200, "shutdown").await.ok();
            started.connection.close(200, "shutdown").await.ok();
        }

        self.transition(Phase::Draining, Phase::Stopped)?;
        Ok(())
    }

    /// Signals shutdown explicitly (in addition to SIGINT/SIGTERM). A second call
    /// after the consumer has already stopped is a no-op at the channel level but
    /// `run()` itself still enforces the single-shutdown state transition.
    pub fn shutdown(&self) -> Result<(), ConsumerError> {
        if self.shutdown_tx.send(true).is_err() {
            return Err(ConsumerError::AlreadyShutDown);
        }
        Ok(())
    }
}

async fn handle_delivery(
    delivery: lapin::message::Delivery,
    pool: Arc<WorkerPool>,
    semaphore: Arc<Semaphore>,
    max_redelivery: Option<u32>,
) {
    let task_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let Some(task_id) = task_id else {
        if let Err(err) = delivery
            .reject(BasicRejectOptions { requeue: false })
            .await
        {
            tracing::error!(event = "consumer.reject_failed", %err, "failed to reject malformed delivery");
        }
        return;
    };

    if let Some(max) = max_redelivery {
        if death_count(&delivery) > max {
            tracing::warn!(event = "consumer.max_redelivery_exceeded", %task_id, "rejecting without requeue");
            if let Err(err) = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await
            {
                tracing::error!(event = "consumer.reject_failed", %err, %task_id);
            }
            return;
        }
    }

    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    let body = String::from_utf8_lossy(&delivery.data).to_string();
    let outcome = pool.submit(task_id.clone(), body).await;
    drop(_permit);

    match outcome {
        Ok(JobOutcome::Success) => {
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                tracing::error!(event = "consumer.ack_failed", %err, %task_id);
            }
        }
        Ok(JobOutcome::Deterministic { cause }) => {
            tracing::info!(event = "consumer.deterministic_error", %task_id, %cause, "reject without requeue");
            if let Err(err) = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await
            {
                tracing::error!(event = "consumer.reject_failed", %err, %task_id);
            }
        }
        Ok(JobOutcome::Transient { cause }) => {
            tracing::warn!(event = "consumer.transient_error", %task_id, %cause, "nack with requeue");
            if let Err(err) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                tracing::error!(event = "consumer.nack_failed", %err, %task_id);
            }
        }
        Err(err) => {
            tracing::warn!(event = "consumer.pool_error", %err, %task_id, "nack with requeue");
            if let Err(err) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                tracing::error!(event = "consumer.nack_failed", %err, %task_id);
            }
        }
    }
}

/// Best-effort redelivery count from the broker's `x-death` header. Requires the
/// queue to be configured with a dead-letter policy that populates it; absent
/// that, this always returns 0, matching the default unbounded behavior.
fn death_count(delivery: &lapin::message::Delivery) -> u32 {
    let Some(headers) = delivery.properties.headers().as_ref() else {
        return 0;
    };
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
        .and_then(|(_, value)| value.as_array())
        .map(|arr| arr.as_slice().len() as u32)
        .unwrap_or(0)
}

