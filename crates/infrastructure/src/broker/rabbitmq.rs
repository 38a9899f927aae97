use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gateway_config::{ArgValue, ExchangeOptions, QueueOptions};
use gateway_errors::{GatewayError, GatewayResult};
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::debug;

use super::{
    Acknowledger, BrokerChannel, BrokerSession, BrokerTransport, ConsumeOptions, Delivery,
    DeliveryHandle, DeliveryMeta, DeliveryStream, MessageProperties,
};

/// 基于 lapin 的 RabbitMQ 传输层
#[derive(Debug, Clone, Copy, Default)]
pub struct RabbitMqTransport;

#[async_trait]
impl BrokerTransport for RabbitMqTransport {
    async fn dial(&self, url: &str) -> GatewayResult<Arc<dyn BrokerSession>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| GatewayError::Connection(format!("连接RabbitMQ失败: {e}")))?;
        Ok(Arc::new(RabbitMqSession { connection }))
    }
}

struct RabbitMqSession {
    connection: Connection,
}

#[async_trait]
impl BrokerSession for RabbitMqSession {
    async fn create_channel(&self) -> GatewayResult<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| GatewayError::Connection(format!("创建通道失败: {e}")))?;
        debug!(channel_id = channel.id(), "通道已创建");
        Ok(Box::new(RabbitMqChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> GatewayResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| GatewayError::Connection(format!("关闭连接失败: {e}")))
    }
}

struct RabbitMqChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> GatewayResult<String> {
        let queue = self
            .channel
            .queue_declare(
                options.name.as_str(),
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                    ..Default::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| GatewayError::topology(options.name.clone(), e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, options: &ExchangeOptions) -> GatewayResult<()> {
        self.channel
            .exchange_declare(
                options.name.as_str(),
                exchange_kind(&options.kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.no_wait,
                    ..Default::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| GatewayError::topology(options.name.clone(), e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> GatewayResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| GatewayError::topology(format!("{exchange} -> {queue}"), e))
    }

    async fn set_prefetch(&self, count: u16) -> GatewayResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| GatewayError::topology("basic.qos", e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> GatewayResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| GatewayError::topology(queue.to_string(), format!("创建消费者失败: {e}")))?;

        let stream = consumer.map(|result| {
            result
                .map(into_delivery)
                .map_err(|e| GatewayError::Connection(format!("接收消息失败: {e}")))
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| GatewayError::Connection(format!("取消消费者 {consumer_tag} 失败: {e}")))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> GatewayResult<()> {
        let mut basic_properties = BasicProperties::default();
        if properties.persistent {
            basic_properties = basic_properties.with_delivery_mode(2); // 2 = persistent
        }
        if let Some(content_type) = &properties.content_type {
            basic_properties = basic_properties.with_content_type(ShortString::from(content_type.clone()));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    ..Default::default()
                },
                payload,
                basic_properties,
            )
            .await
            .map_err(|e| GatewayError::Publish(format!("发布消息到 {exchange}/{routing_key} 失败: {e}")))?;

        confirm
            .await
            .map_err(|e| GatewayError::Publish(format!("消息发布确认失败: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        self.channel
            .close(200, "正常关闭")
            .await
            .map_err(|e| GatewayError::Connection(format!("关闭通道失败: {e}")))
    }
}

struct LapinAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(self: Box<Self>) -> GatewayResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::Acknowledge(format!("确认消息失败: {e}")))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> GatewayResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::Acknowledge(format!("拒绝消息失败: {e}")))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let meta = DeliveryMeta {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
    };
    Delivery {
        meta,
        body: delivery.data,
        handle: DeliveryHandle::new(Box::new(LapinAcknowledger {
            acker: delivery.acker,
        })),
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "fanout" => ExchangeKind::Fanout,
        "direct" => ExchangeKind::Direct,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn field_table(arguments: &BTreeMap<String, ArgValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgValue::Bool(flag) => AMQPValue::Boolean(*flag),
            ArgValue::Int(number) => AMQPValue::LongLongInt(*number),
            ArgValue::Text(text) => AMQPValue::LongString(LongString::from(text.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}
