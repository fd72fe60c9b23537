//! `lapin`-backed implementation of the transport traits

use super::options::{
    connection_properties, connection_uri, delivery_from_lapin, exchange_kind, field_table,
    map_lapin_error, publish_properties,
};
use crate::error::BrokerError;
use crate::protocol::{ExchangeSpec, PublishRequest, QueueSpec};
use crate::transport::{
    Acknowledger, BrokerConnection, BrokerEndpoint, BrokerSession, CloseNotify, Connector,
    DeliveryStream, InboundDelivery, Subscription,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::{Channel, Connection};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;

/// Dials AMQP 0-9-1 brokers with `lapin`
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let uri = connection_uri(endpoint)?;
        let connection = Connection::connect(&uri, connection_properties(endpoint))
            .await
            .map_err(|e| BrokerError::ConnectFailed(map_lapin_error(e).to_string()))?;

        let (close_tx, close_rx) = watch::channel(None);
        connection.on_error(move |err| {
            let reason = map_lapin_error(err);
            warn!(error = %reason, "broker connection failed");
            let _ = close_tx.send(Some(reason));
        });

        debug!(url = %endpoint.display_url(), "broker connection open");
        Ok(Arc::new(AmqpConnection {
            connection,
            close_rx,
            publisher_confirms: endpoint.publisher_confirms,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    close_rx: CloseNotify,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(map_lapin_error)?;

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(map_lapin_error)?;
        }

        Ok(Box::new(AmqpSession { channel }))
    }

    fn close_notify(&self) -> CloseNotify {
        self.close_rx.clone()
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "client closing")
            .await
            .map_err(map_lapin_error)
    }
}

struct AmqpSession {
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn publish(&mut self, request: &PublishRequest) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions::default(),
                &request.body,
                publish_properties(request),
            )
            .await
            .map_err(map_lapin_error)?;

        let confirmation = confirm.await.map_err(map_lapin_error)?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishNacked);
        }
        Ok(())
    }

    async fn consume(&mut self, subscription: &Subscription) -> Result<DeliveryStream, BrokerError> {
        if subscription.prefetch_count > 0 {
            self.channel
                .basic_qos(subscription.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(map_lapin_error)?;
        }

        let consumer = self
            .channel
            .basic_consume(
                &subscription.queue,
                &subscription.consumer_tag,
                BasicConsumeOptions {
                    no_ack: subscription.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                field_table(&subscription.arguments),
            )
            .await
            .map_err(map_lapin_error)?;

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                let mapped = delivery_from_lapin(&delivery);
                InboundDelivery::new(mapped, Box::new(AmqpAcker(delivery.acker)))
            })
            .map_err(map_lapin_error)
        });
        Ok(stream.boxed())
    }

    async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        exchange.validate()?;
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&exchange.arguments),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), BrokerError> {
        queue.validate()?;
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&queue.arguments),
            )
            .await
            .map_err(map_lapin_error)?;

        for binding in &queue.bindings {
            self.channel
                .queue_bind(
                    &queue.name,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    field_table(&binding.arguments),
                )
                .await
                .map_err(map_lapin_error)?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "session released")
            .await
            .map_err(map_lapin_error)
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(map_lapin_error)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(map_lapin_error)
    }
}
