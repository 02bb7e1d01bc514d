use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use mailgate_common::internal;

use crate::{
    config::QueueConfig,
    error::{QueueError, Result},
    message::{Acknowledge, QueueMessage},
    queue::{Deliveries, MessageQueue},
};

/// Delivery mode marking a message as persistent.
const PERSISTENT: u8 = 2;

const CONSUMER_TAG: &str = "mailgate-delivery";

/// RabbitMQ backed queue.
///
/// Publishes go through one confirm-mode channel shared by every producer;
/// each subscription opens its own channel so its prefetch window does not
/// affect publishing.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    name: String,
}

impl std::fmt::Debug for AmqpQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpQueue")
            .field("name", &self.name)
            .field("status", &self.connection.status().state())
            .finish_non_exhaustive()
    }
}

impl AmqpQueue {
    /// Connect to the broker and declare the durable queue.
    ///
    /// # Errors
    /// If the broker is unreachable or refuses the declaration.
    #[tracing::instrument(level = "debug", skip_all, fields(host = %config.host, queue = %config.name), err)]
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Self::declare(&channel, &config.name, false).await?;

        internal!(
            level = INFO,
            "Connected to broker at {}:{}, queue {}",
            config.host,
            config.port,
            config.name
        );

        Ok(Self {
            connection,
            channel,
            name: config.name.clone(),
        })
    }

    async fn declare(channel: &Channel, name: &str, passive: bool) -> Result<u32> {
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    passive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.message_count())
    }

    /// Close the broker connection.
    ///
    /// # Errors
    /// If the connection was already lost.
    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "shutting down").await?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::Rejected);
        }

        Ok(())
    }

    async fn subscribe(&self, prefetch: u16) -> Result<Deliveries> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Self::declare(&channel, &self.name, false).await?;

        let consumer = channel
            .basic_consume(
                &self.name,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        internal!(level = DEBUG, "Consuming {} with prefetch {prefetch}", self.name);

        Ok(consumer
            .map(move |delivery| {
                // The consumer only lives as long as its channel.
                let _channel = &channel;

                delivery.map_err(QueueError::from).map(|delivery| {
                    QueueMessage::new(
                        delivery.delivery_tag,
                        delivery.redelivered,
                        delivery.data,
                        AmqpAcker(delivery.acker),
                    )
                })
            })
            .boxed())
    }

    async fn depth(&self) -> Result<u32> {
        // A failed passive declare closes its channel, so never use the
        // publish channel for it.
        let channel = self.connection.create_channel().await?;
        let depth = Self::declare(&channel, &self.name, true).await?;

        if let Err(err) = channel.close(200, "depth sampled").await {
            internal!(level = DEBUG, "Failed to close sampling channel: {err}");
        }

        Ok(depth)
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
