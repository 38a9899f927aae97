//! 消息代理抽象
//!
//! 网关只通过这里的 trait 与消息代理交互，生产环境使用 RabbitMQ（lapin），
//! 嵌入式部署和测试使用内存实现。

pub mod in_memory;
pub mod rabbitmq;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use gateway_config::{ExchangeOptions, QueueOptions};
use gateway_errors::GatewayResult;

pub use in_memory::{AckOutcome, AckRecord, InMemoryBroker};
pub use rabbitmq::RabbitMqTransport;

pub type DeliveryStream = BoxStream<'static, GatewayResult<Delivery>>;

/// 建立到消息代理的连接
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn dial(&self, url: &str) -> GatewayResult<Arc<dyn BrokerSession>>;
}

/// 一条已建立的连接
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_channel(&self) -> GatewayResult<Box<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> GatewayResult<()>;
}

/// 连接上的一个通道
///
/// 通道只归创建它的 worker 所有，不在多个 worker 之间共享。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 声明队列，返回实际队列名（服务端命名的队列由代理生成）
    async fn declare_queue(&self, options: &QueueOptions) -> GatewayResult<String>;

    async fn declare_exchange(&self, options: &ExchangeOptions) -> GatewayResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> GatewayResult<()>;

    async fn set_prefetch(&self, count: u16) -> GatewayResult<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> GatewayResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> GatewayResult<()>;

    async fn close(&self) -> GatewayResult<()>;
}

/// 对单条投递做最终确认
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> GatewayResult<()>;

    async fn nack(self: Box<Self>, requeue: bool) -> GatewayResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub persistent: bool,
    pub mandatory: bool,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            content_type: None,
            persistent: true,
            mandatory: false,
        }
    }
}

/// 投递的元数据，会随事件交给消费回调
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMeta {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
}

/// 一条投递的确认句柄，只能被消费一次
pub struct DeliveryHandle {
    acker: Box<dyn Acknowledger>,
}

impl DeliveryHandle {
    pub fn new(acker: Box<dyn Acknowledger>) -> Self {
        Self { acker }
    }

    pub async fn ack(self) -> GatewayResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> GatewayResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle").finish_non_exhaustive()
    }
}

/// 一条入站消息
#[derive(Debug)]
pub struct Delivery {
    pub meta: DeliveryMeta,
    pub body: Vec<u8>,
    pub handle: DeliveryHandle,
}

impl Delivery {
    pub fn into_parts(self) -> (DeliveryMeta, Vec<u8>, DeliveryHandle) {
        (self.meta, self.body, self.handle)
    }
}
