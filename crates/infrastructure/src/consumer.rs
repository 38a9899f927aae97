//! 队列订阅循环
//!
//! 每个订阅一个 worker，worker 独占自己的通道。prefetch 为 1，
//! 一条投递的"解码 -> 回调 -> 确认"全部完成后才会收到下一条。

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gateway_config::{QueueTopologyConfig, WireFormat};
use gateway_domain::{CompletionDecision, EventVariant};
use gateway_errors::{GatewayError, GatewayResult};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack::AcknowledgementPolicy;
use crate::broker::{BrokerChannel, ConsumeOptions, Delivery, DeliveryMeta};
use crate::codec::EventCodec;
use crate::connection::BrokerConnection;
use crate::metrics;
use crate::topology::{DeclaredTopology, QueueTopologyManager};

const PAYLOAD_EXCERPT_CHARS: usize = 200;

/// 交给回调的入站事件，确认句柄留在循环内部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound<E> {
    pub event: E,
    pub meta: DeliveryMeta,
}

/// 消费回调，返回值决定这条投递如何确认
#[async_trait]
pub trait EventHandler<E: EventVariant>: Send + Sync {
    async fn handle(&self, inbound: Inbound<E>) -> CompletionDecision;
}

/// 把异步闭包包装成 [`EventHandler`]
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for HandlerFn<F>
where
    E: EventVariant,
    F: Fn(Inbound<E>) -> Fut + Send + Sync,
    Fut: Future<Output = CompletionDecision> + Send,
{
    async fn handle(&self, inbound: Inbound<E>) -> CompletionDecision {
        (self.f)(inbound).await
    }
}

/// 订阅循环的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    AwaitingDelivery,
    Processing,
    Completing,
}

/// 订阅循环结束时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub accepted: u64,
    /// 所有以 Reject 确认的投递，包括无效消息
    pub rejected: u64,
    pub requeued: u64,
    pub invalid: u64,
}

pub struct ConsumerLoop<E: EventVariant> {
    channel: Box<dyn BrokerChannel>,
    declared: DeclaredTopology,
    consumer_tag: String,
    wire_format: WireFormat,
    codec: Arc<EventCodec>,
    handler: Arc<dyn EventHandler<E>>,
    state: watch::Sender<ConsumerState>,
    _event: PhantomData<fn() -> E>,
}

impl<E: EventVariant> ConsumerLoop<E> {
    /// 打开通道并声明拓扑，此时还没有开始消费
    pub async fn new(
        connection: &BrokerConnection,
        codec: Arc<EventCodec>,
        topology: &QueueTopologyConfig,
        handler: Arc<dyn EventHandler<E>>,
    ) -> GatewayResult<Self> {
        let channel = QueueTopologyManager::open_channel(connection).await?;
        let declared = QueueTopologyManager::new(channel.as_ref())
            .declare(topology)
            .await?;
        let consumer_tag = consumer_tag(topology, &declared.queue_name);
        let (state, _) = watch::channel(ConsumerState::Idle);

        debug!(queue = %declared.queue_name, consumer_tag = %consumer_tag, event = %E::KIND, "订阅已准备");
        Ok(Self {
            channel,
            declared,
            consumer_tag,
            wire_format: topology.wire_format,
            codec,
            handler,
            state,
            _event: PhantomData,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.declared.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// 订阅状态的观察端
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<GatewayResult<ConsumerStats>> {
        tokio::spawn(self.run(shutdown))
    }

    /// 消费直到收到关闭信号或投递流结束
    ///
    /// 关闭信号只在等待投递时生效，正在处理的投递总会先完成确认。
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> GatewayResult<ConsumerStats> {
        let queue = self.declared.queue_name.clone();
        let mut deliveries = self
            .channel
            .consume(&queue, &self.consumer_tag, ConsumeOptions::default())
            .await?;
        self.state.send_replace(ConsumerState::AwaitingDelivery);
        info!(queue = %queue, consumer_tag = %self.consumer_tag, "开始消费队列");

        let mut stats = ConsumerStats::default();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(queue = %queue, "收到关闭信号，停止消费");
                    break Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.process(&queue, delivery, &mut stats).await {
                        error!(queue = %queue, error = %e, "确认投递失败，停止消费");
                        break Err(e);
                    }
                    self.state.send_replace(ConsumerState::AwaitingDelivery);
                }
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "接收投递失败，停止消费");
                    break Err(e);
                }
                None => {
                    warn!(queue = %queue, "投递流已结束");
                    break Ok(());
                }
            }
        };

        self.state.send_replace(ConsumerState::Idle);
        drop(deliveries);
        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            debug!(queue = %queue, error = %e, "取消消费者失败");
        }
        if let Err(e) = self.channel.close().await {
            debug!(queue = %queue, error = %e, "关闭通道失败");
        }

        info!(
            queue = %queue,
            received = stats.received,
            accepted = stats.accepted,
            rejected = stats.rejected,
            requeued = stats.requeued,
            invalid = stats.invalid,
            "订阅已停止"
        );
        outcome.map(|_| stats)
    }

    async fn process(&self, queue: &str, delivery: Delivery, stats: &mut ConsumerStats) -> GatewayResult<()> {
        self.state.send_replace(ConsumerState::Processing);
        let (meta, body, handle) = delivery.into_parts();
        stats.received += 1;
        metrics::record_consumed(queue);

        // 消息自带的 content-type 优先于拓扑配置
        let format = meta
            .content_type
            .as_deref()
            .and_then(WireFormat::from_content_type)
            .unwrap_or(self.wire_format);

        let decision = match self.codec.decode_bytes::<E>(format, &body) {
            Ok(event) => {
                debug!(
                    queue,
                    delivery_tag = meta.delivery_tag,
                    redelivered = meta.redelivered,
                    "收到事件"
                );
                self.handler.handle(Inbound { event, meta }).await
            }
            Err(err) => {
                stats.invalid += 1;
                let reason = match &err {
                    GatewayError::Validation(_) => "validation",
                    _ => "decode",
                };
                metrics::record_invalid(queue, reason);
                warn!(
                    queue,
                    delivery_tag = meta.delivery_tag,
                    error = %err,
                    payload = %excerpt(&body),
                    "无效消息，已拒绝"
                );
                CompletionDecision::Reject
            }
        };

        self.state.send_replace(ConsumerState::Completing);
        AcknowledgementPolicy::apply(decision, handle, queue).await?;
        match decision {
            CompletionDecision::Accept => stats.accepted += 1,
            CompletionDecision::Reject => stats.rejected += 1,
            CompletionDecision::RejectAndRequeue => stats.requeued += 1,
        }
        Ok(())
    }
}

fn consumer_tag(topology: &QueueTopologyConfig, queue: &str) -> String {
    if !topology.consumer_name.is_empty() {
        return topology.consumer_name.clone();
    }
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "gateway".to_string());
    format!("{host}-{queue}")
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(PAYLOAD_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::connection::RetryPolicy;
    use crate::schema::SchemaValidator;
    use gateway_domain::SliceAddedEvent;
    use std::time::Duration;

    const JOB_ID: &str = "620b8251-52a1-4ecd-8adc-4fb280214bba";

    fn fixture() -> (InMemoryBroker, BrokerConnection, Arc<EventCodec>) {
        let broker = InMemoryBroker::new();
        let connection = BrokerConnection::new(
            "memory://localhost/",
            Arc::new(broker.clone()),
            RetryPolicy::default(),
        );
        let codec = Arc::new(EventCodec::new(SchemaValidator::bundled_v1().unwrap()));
        (broker, connection, codec)
    }

    #[test]
    fn test_excerpt_truncates_long_payloads() {
        assert_eq!(excerpt(b"<SliceAdded/>"), "<SliceAdded/>");
        let long = "x".repeat(500);
        assert_eq!(excerpt(long.as_bytes()).len(), PAYLOAD_EXCERPT_CHARS + 3);
    }

    #[test]
    fn test_consumer_tag_prefers_configured_name() {
        let mut topology = QueueTopologyConfig::work_queue("slice-added", WireFormat::Xml);
        assert!(consumer_tag(&topology, "slice-added").ends_with("-slice-added"));
        topology.consumer_name = "encoder-7".to_string();
        assert_eq!(consumer_tag(&topology, "slice-added"), "encoder-7");
    }

    #[tokio::test]
    async fn test_state_transitions_and_shutdown() {
        let (broker, connection, codec) = fixture();
        let topology = QueueTopologyConfig::work_queue("slice-added", WireFormat::Json);
        let handler = handler_fn(|_inbound: Inbound<SliceAddedEvent>| async { CompletionDecision::Accept });
        let consumer = ConsumerLoop::<SliceAddedEvent>::new(&connection, codec, &topology, Arc::new(handler))
            .await
            .unwrap();

        let mut state = consumer.state();
        assert_eq!(*state.borrow(), ConsumerState::Idle);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = consumer.spawn(shutdown_rx);

        state
            .wait_for(|s| *s == ConsumerState::AwaitingDelivery)
            .await
            .unwrap();

        let body = format!(r#"{{"job_id":"{JOB_ID}","slice_nr":1,"args":[]}}"#);
        broker
            .publish_raw("", "slice-added", body, Some("application/json"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.ack_log().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(*state.borrow(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected_and_loop_continues() {
        let (broker, connection, codec) = fixture();
        let topology = QueueTopologyConfig::work_queue("slice-added", WireFormat::Xml);
        let handler = handler_fn(|_inbound: Inbound<SliceAddedEvent>| async { CompletionDecision::Accept });
        let consumer = ConsumerLoop::<SliceAddedEvent>::new(&connection, codec, &topology, Arc::new(handler))
            .await
            .unwrap();

        broker
            .publish_raw("", "slice-added", "<SliceAdded><SliceNr>1</SliceNr></SliceAdded>", None)
            .await
            .unwrap();
        let valid = format!("<SliceAdded><JobId>{JOB_ID}</JobId><SliceNr>2</SliceNr></SliceAdded>");
        broker.publish_raw("", "slice-added", valid, None).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = consumer.spawn(shutdown_rx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.ack_log().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send(()).unwrap();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 1);
    }
}
