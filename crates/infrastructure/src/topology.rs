//! 队列拓扑声明

use gateway_config::QueueTopologyConfig;
use gateway_errors::GatewayResult;
use tracing::debug;

use crate::broker::BrokerChannel;
use crate::connection::BrokerConnection;

/// 声明完成后的拓扑，队列名可能由代理生成
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub queue_name: String,
    pub exchange: Option<String>,
}

/// 在一个通道上声明队列、交换机和绑定
///
/// 所有声明都是幂等的；参数与代理上已有的定义不一致时返回 `TopologyDeclaration` 错误。
pub struct QueueTopologyManager<'a> {
    channel: &'a dyn BrokerChannel,
}

impl<'a> QueueTopologyManager<'a> {
    pub fn new(channel: &'a dyn BrokerChannel) -> Self {
        Self { channel }
    }

    /// 每个拓扑使用自己的通道
    pub async fn open_channel(connection: &BrokerConnection) -> GatewayResult<Box<dyn BrokerChannel>> {
        connection.open_channel().await
    }

    pub async fn declare_queue(&self, topology: &QueueTopologyConfig) -> GatewayResult<String> {
        let name = self.channel.declare_queue(&topology.queue).await?;
        debug!(
            queue = %name,
            durable = topology.queue.durable,
            exclusive = topology.queue.exclusive,
            "队列声明成功"
        );
        Ok(name)
    }

    /// 拓扑没有交换机时什么也不做
    pub async fn declare_exchange(&self, topology: &QueueTopologyConfig) -> GatewayResult<()> {
        if let Some(exchange) = &topology.exchange {
            self.channel.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, kind = %exchange.kind, "交换机声明成功");
        }
        Ok(())
    }

    pub async fn bind_queue(&self, topology: &QueueTopologyConfig, queue: &str) -> GatewayResult<()> {
        if let Some(exchange) = &topology.exchange {
            self.channel
                .bind_queue(queue, &exchange.name, &topology.routing_key)
                .await?;
            debug!(queue, exchange = %exchange.name, routing_key = %topology.routing_key, "队列绑定成功");
        }
        Ok(())
    }

    pub async fn set_prefetch(&self, count: u16) -> GatewayResult<()> {
        self.channel.set_prefetch(count).await
    }

    /// 消费端：交换机、队列、绑定和 prefetch
    pub async fn declare(&self, topology: &QueueTopologyConfig) -> GatewayResult<DeclaredTopology> {
        self.declare_exchange(topology).await?;
        let queue_name = self.declare_queue(topology).await?;
        self.bind_queue(topology, &queue_name).await?;
        self.set_prefetch(topology.prefetch_count).await?;

        Ok(DeclaredTopology {
            queue_name,
            exchange: topology.exchange.as_ref().map(|e| e.name.clone()),
        })
    }

    /// 发布端：有交换机时只声明交换机，订阅队列由各消费者自己创建
    pub async fn declare_for_publish(&self, topology: &QueueTopologyConfig) -> GatewayResult<DeclaredTopology> {
        match &topology.exchange {
            Some(exchange) => {
                self.declare_exchange(topology).await?;
                Ok(DeclaredTopology {
                    queue_name: String::new(),
                    exchange: Some(exchange.name.clone()),
                })
            }
            None => Ok(DeclaredTopology {
                queue_name: self.declare_queue(topology).await?,
                exchange: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSession, BrokerTransport, InMemoryBroker};
    use gateway_config::WireFormat;
    use std::sync::Arc;

    async fn channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerSession>, Box<dyn BrokerChannel>) {
        let session = broker.dial("memory://").await.unwrap();
        let channel = session.create_channel().await.unwrap();
        (session, channel)
    }

    #[tokio::test]
    async fn test_declare_work_queue() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = channel(&broker).await;
        let manager = QueueTopologyManager::new(channel.as_ref());

        let topology = QueueTopologyConfig::work_queue("slice-added", WireFormat::Xml);
        let declared = manager.declare(&topology).await.unwrap();
        assert_eq!(declared.queue_name, "slice-added");
        assert!(declared.exchange.is_none());

        // 重复声明是幂等的
        assert_eq!(manager.declare(&topology).await.unwrap(), declared);
        assert!(broker.queue_exists("slice-added").await);
    }

    #[tokio::test]
    async fn test_declare_fanout_subscription() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = channel(&broker).await;
        let manager = QueueTopologyManager::new(channel.as_ref());

        let topology = QueueTopologyConfig::fanout_subscription("task-cancelled", WireFormat::Xml);
        let declared = manager.declare(&topology).await.unwrap();
        assert!(declared.queue_name.starts_with("amq.gen-"));
        assert_eq!(declared.exchange.as_deref(), Some("task-cancelled"));
        assert_eq!(broker.bound_queues("task-cancelled").await, vec![declared.queue_name]);
    }

    #[tokio::test]
    async fn test_publish_side_does_not_create_subscription_queue() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = channel(&broker).await;
        let manager = QueueTopologyManager::new(channel.as_ref());

        let topology = QueueTopologyConfig::fanout_subscription("task-cancelled", WireFormat::Xml);
        let declared = manager.declare_for_publish(&topology).await.unwrap();
        assert!(declared.queue_name.is_empty());
        assert!(broker.bound_queues("task-cancelled").await.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_declaration_is_fatal() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = channel(&broker).await;
        let manager = QueueTopologyManager::new(channel.as_ref());

        let topology = QueueTopologyConfig::work_queue("task-added", WireFormat::Xml);
        manager.declare(&topology).await.unwrap();

        let dead_lettered = topology.clone().with_dead_letter_exchange("gateway-dlx");
        let err = manager.declare(&dead_lettered).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
