//! Producer (C2): durable topology declaration and confirmed, persistent publish.

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub amqp_uri: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub app_name: String,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("producer already started")]
    AlreadyStarted,
    #[error("producer not started")]
    NotStarted,
    #[error("producer already shut down")]
    AlreadyShutDown,
    #[error("amqp transport error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("broker did not confirm the publish (got {0:?})")]
    NotAcked(Confirmation),
    #[error("failed to serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum State {
    Created,
    Started { connection: Connection, channel: Channel },
    ShutDown,
}

/// Owns one AMQP connection. `startup`/`shutdown` are each idempotent-guarded: a
/// second call on either fails rather than silently succeeding.
pub struct Producer {
    config: ProducerConfig,
    state: Mutex<State>,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Created),
        }
    }

    pub async fn startup(&self) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Created) {
            return Err(PublishError::AlreadyStarted);
        }

        let connection =
            Connection::connect(&self.config.amqp_uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

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

        *state = State::Started { connection, channel };
        Ok(())
    }

    /// Serializes `data`, derives the message id (`task_id` if given, else a fresh
    /// UUIDv4), publishes persistent, and awaits the broker's confirm. Returns the
    /// message id that was actually published.
    pub async fn send<T: Serialize>(
        &self,
        data: &T,
        task_id: Option<Uuid>,
    ) -> Result<Uuid, PublishError> {
        let state = self.state.lock().await;
        let channel = match &*state {
            State::Started { channel, .. } => channel,
            State::Created => return Err(PublishError::NotStarted),
            State::ShutDown => return Err(PublishError::AlreadyShutDown),
        };

        let message_id = task_id.unwrap_or_else(Uuid::new_v4);
        let body = serde_json::to_vec(data)?;

        let properties = BasicProperties::default()
            .with_message_id(message_id.simple().to_string().into())
            .with_app_id(self.config.app_name.clone().into())
            .with_delivery_mode(2)
            .with_content_type("application/json".into());

        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                &self.config.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if !confirm.is_ack() {
            return Err(PublishError::NotAcked(confirm));
        }

        Ok(message_id)
    }

    pub async fn shutdown(&self) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::ShutDown) {
            State::Started { connection, channel } => {
                channel.close(200, "shutdown").await?;
                connection.close(200, "shutdown").await?;
                Ok(())
            }
            State::Created => {
                *state = State::Created;
                Err(PublishError::NotStarted)
            }
            State::ShutDown => Err(PublishError::AlreadyShutDown),
        }
    }
}
