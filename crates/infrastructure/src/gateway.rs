//! 网关上下文
//!
//! 持有唯一的消息代理连接、编解码器和拓扑集合，订阅和发布者都从这里创建。

use std::sync::Arc;

use gateway_config::{AppConfig, BrokerConfig, BrokerType, QueueTopologyConfig, TopologySet};
use gateway_domain::{EventKind, EventVariant};
use gateway_errors::GatewayResult;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::{BrokerSession, BrokerTransport, InMemoryBroker, RabbitMqTransport};
use crate::codec::EventCodec;
use crate::connection::BrokerConnection;
use crate::consumer::{ConsumerLoop, EventHandler};
use crate::publisher::{Publisher, PublisherHandle, PublisherStats, PublisherWorker};
use crate::schema::SchemaValidator;

#[derive(Debug, Clone)]
pub struct Gateway {
    connection: Arc<BrokerConnection>,
    codec: Arc<EventCodec>,
    topologies: TopologySet,
}

impl Gateway {
    pub fn new(connection: Arc<BrokerConnection>, codec: EventCodec, topologies: TopologySet) -> Self {
        Self {
            connection,
            codec: Arc::new(codec),
            topologies,
        }
    }

    /// 按配置选择传输层
    pub fn transport_for(config: &BrokerConfig) -> Arc<dyn BrokerTransport> {
        match config.r#type {
            BrokerType::Rabbitmq => Arc::new(RabbitMqTransport),
            BrokerType::InMemory => Arc::new(InMemoryBroker::new()),
        }
    }

    /// 加载 Schema 并建立连接，两者任一失败都是启动期的致命错误
    pub async fn from_config(config: &AppConfig) -> GatewayResult<Self> {
        let schema = SchemaValidator::load(&config.api.schema.latest)?;
        let transport = Self::transport_for(&config.rabbitmq);
        let gateway = Self::with_transport(config, schema, transport);
        gateway.connect().await?;
        Ok(gateway)
    }

    pub fn with_transport(
        config: &AppConfig,
        schema: SchemaValidator,
        transport: Arc<dyn BrokerTransport>,
    ) -> Self {
        let connection = BrokerConnection::from_config(&config.rabbitmq, transport);
        Self::new(Arc::new(connection), EventCodec::new(schema), config.topologies())
    }

    /// 幂等，已经连接时返回同一个连接
    pub async fn connect(&self) -> GatewayResult<Arc<dyn BrokerSession>> {
        self.connection.connect().await
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn codec(&self) -> &Arc<EventCodec> {
        &self.codec
    }

    pub fn topologies(&self) -> &TopologySet {
        &self.topologies
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// 订阅 `E` 对应的预置拓扑
    pub async fn consumer<E: EventVariant>(
        &self,
        handler: Arc<dyn EventHandler<E>>,
    ) -> GatewayResult<ConsumerLoop<E>> {
        let topology = self.topologies.get(E::KIND).clone();
        self.consumer_on(&topology, handler).await
    }

    pub async fn consumer_on<E: EventVariant>(
        &self,
        topology: &QueueTopologyConfig,
        handler: Arc<dyn EventHandler<E>>,
    ) -> GatewayResult<ConsumerLoop<E>> {
        ConsumerLoop::new(&self.connection, self.codec.clone(), topology, handler).await
    }

    pub async fn publisher(&self, kind: EventKind) -> GatewayResult<Publisher> {
        let topology = self.topologies.get(kind).clone();
        Publisher::open(&self.connection, self.codec.clone(), kind, topology).await
    }

    /// 打开发布者并在后台运行它的 worker
    pub async fn spawn_publisher(
        &self,
        kind: EventKind,
        capacity: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> GatewayResult<(PublisherHandle, JoinHandle<PublisherStats>)> {
        let publisher = self.publisher(kind).await?;
        let (worker, handle) = PublisherWorker::new(publisher, capacity);
        Ok((handle, worker.spawn(shutdown)))
    }

    /// 关闭连接，调用前应先停止所有订阅和发布者
    pub async fn shutdown(&self) -> GatewayResult<()> {
        self.connection.close().await?;
        info!("网关已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_config() -> AppConfig {
        AppConfig {
            rabbitmq: BrokerConfig::in_memory_default(),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_with_in_memory_transport() {
        let config = in_memory_config();
        let broker = InMemoryBroker::new();
        let gateway = Gateway::with_transport(
            &config,
            SchemaValidator::bundled_v1().unwrap(),
            Arc::new(broker.clone()),
        );
        assert!(!gateway.is_connected());

        let first = gateway.connect().await.unwrap();
        let second = gateway.connect().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(gateway.is_connected());

        let publisher = gateway.publisher(EventKind::SliceAdded).await.unwrap();
        assert_eq!(publisher.target(), ("", "slice-added"));

        gateway.shutdown().await.unwrap();
        assert!(!gateway.is_connected());
        assert_eq!(broker.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_from_config_fails_without_schema() {
        let mut config = in_memory_config();
        config.api.schema.latest = "/nonexistent/clustercode_v1.xsd".to_string();
        let err = Gateway::from_config(&config).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
