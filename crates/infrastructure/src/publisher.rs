//! 事件发布
//!
//! [`Publisher`] 负责编码和发送；[`PublisherWorker`] 从进程内队列取事件，
//! 逐个交给 Publisher，单个事件失败只记录不退出。

use std::sync::Arc;

use gateway_config::QueueTopologyConfig;
use gateway_domain::{Event, EventKind};
use gateway_errors::{GatewayError, GatewayResult};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, MessageProperties};
use crate::codec::EventCodec;
use crate::connection::BrokerConnection;
use crate::metrics;
use crate::topology::{DeclaredTopology, QueueTopologyManager};

pub struct Publisher {
    kind: EventKind,
    channel: Box<dyn BrokerChannel>,
    topology: QueueTopologyConfig,
    declared: DeclaredTopology,
    codec: Arc<EventCodec>,
}

impl Publisher {
    /// 打开独占通道并声明发布端拓扑
    pub async fn open(
        connection: &BrokerConnection,
        codec: Arc<EventCodec>,
        kind: EventKind,
        topology: QueueTopologyConfig,
    ) -> GatewayResult<Self> {
        let channel = QueueTopologyManager::open_channel(connection).await?;
        let declared = QueueTopologyManager::new(channel.as_ref())
            .declare_for_publish(&topology)
            .await?;
        Ok(Self {
            kind,
            channel,
            topology,
            declared,
            codec,
        })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// (exchange, routing_key)
    pub fn target(&self) -> (&str, &str) {
        self.topology.publish_target(&self.declared.queue_name)
    }

    /// 按拓扑的线上格式编码并以持久化消息发送
    pub async fn publish(&self, event: &Event) -> GatewayResult<()> {
        if event.kind() != self.kind {
            return Err(GatewayError::Encode(format!(
                "publisher for {} cannot send a {} event",
                self.kind,
                event.kind()
            )));
        }

        let (exchange, routing_key) = self.target();
        let format = self.topology.wire_format;
        let payload = self.codec.encode(format, event)?;
        let properties = MessageProperties {
            content_type: Some(format.content_type().to_string()),
            persistent: true,
            mandatory: self.topology.mandatory,
        };

        match self
            .channel
            .publish(exchange, routing_key, payload.as_bytes(), &properties)
            .await
        {
            Ok(()) => {
                metrics::record_published(exchange, routing_key);
                debug!(exchange, routing_key, job_id = event.job_id(), "事件已发布");
                Ok(())
            }
            Err(e) => {
                metrics::record_publish_error(exchange, routing_key);
                Err(e)
            }
        }
    }

    pub async fn close(self) -> GatewayResult<()> {
        self.channel.close().await
    }
}

/// 发布 worker 的生产端
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    kind: EventKind,
    sender: mpsc::Sender<Event>,
}

impl PublisherHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// 把事件放进发布队列；worker 已退出时返回 `Publish` 错误
    pub async fn send(&self, event: impl Into<Event>) -> GatewayResult<()> {
        let event = event.into();
        if event.kind() != self.kind {
            return Err(GatewayError::Encode(format!(
                "publisher for {} cannot send a {} event",
                self.kind,
                event.kind()
            )));
        }
        self.sender
            .send(event)
            .await
            .map_err(|_| GatewayError::Publish(format!("{} 发布者已停止", self.kind)))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
}

pub struct PublisherWorker {
    publisher: Publisher,
    receiver: mpsc::Receiver<Event>,
}

impl PublisherWorker {
    pub fn new(publisher: Publisher, capacity: usize) -> (Self, PublisherHandle) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = PublisherHandle {
            kind: publisher.kind(),
            sender,
        };
        (Self { publisher, receiver }, handle)
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<PublisherStats> {
        tokio::spawn(self.run(shutdown))
    }

    /// 发送队列中的事件直到收到关闭信号，随后发完剩余事件再关闭通道
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> PublisherStats {
        let kind = self.publisher.kind();
        let mut stats = PublisherStats::default();
        info!(event = %kind, "发布者已启动");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(event = %kind, "收到关闭信号，发布剩余事件");
                    break;
                }
                next = self.receiver.recv() => match next {
                    Some(event) => self.publish_one(&event, &mut stats).await,
                    None => break,
                },
            }
        }

        self.receiver.close();
        while let Some(event) = self.receiver.recv().await {
            self.publish_one(&event, &mut stats).await;
        }

        if let Err(e) = self.publisher.close().await {
            warn!(event = %kind, error = %e, "关闭发布通道失败");
        }
        info!(
            event = %kind,
            published = stats.published,
            failed = stats.failed,
            "发布者已停止"
        );
        stats
    }

    async fn publish_one(&self, event: &Event, stats: &mut PublisherStats) {
        match self.publisher.publish(event).await {
            Ok(()) => stats.published += 1,
            Err(e) => {
                stats.failed += 1;
                error!(event = %event.kind(), job_id = event.job_id(), error = %e, "发布事件失败");
            }
        }
    }
}
