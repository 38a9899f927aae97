//! 内存消息代理
//!
//! 实现与 AMQP 一致的语义：声明参数不一致时报错、独占队列、服务端命名队列、
//! fanout/direct 路由、prefetch 窗口、重新入队标记 redelivered、死信转发。
//! 适用于嵌入式部署和测试，同时记录每一次确认调用便于断言。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gateway_config::{ArgValue, ExchangeOptions, QueueOptions};
use gateway_errors::{GatewayError, GatewayResult};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Acknowledger, BrokerChannel, BrokerSession, BrokerTransport, ConsumeOptions, Delivery,
    DeliveryHandle, DeliveryMeta, DeliveryStream, MessageProperties,
};

/// 一次确认调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// 确认调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    persistent: bool,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<GatewayResult<Delivery>>,
    prefetch: u16,
    in_flight: usize,
    no_ack: bool,
    exclusive: bool,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: StoredMessage,
    consumer_id: u64,
    channel_id: u64,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    cursor: usize,
    next_tag: u64,
}

impl QueueState {
    fn dead_letter_exchange(&self) -> Option<String> {
        match self.options.arguments.get("x-dead-letter-exchange") {
            Some(ArgValue::Text(exchange)) => Some(exchange.clone()),
            _ => None,
        }
    }
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    /// 通道 ID -> 会话 ID
    channels: HashMap<u64, u64>,
    ack_log: Vec<AckRecord>,
    unroutable: usize,
}

#[derive(Default)]
struct BrokerState {
    inner: Mutex<Inner>,
    dials: AtomicUsize,
    failing_dials: AtomicUsize,
    next_id: AtomicU64,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 内存消息代理，克隆后共享同一份状态
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("dials", &self.dial_count())
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立连接的次数
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// 让接下来的 `count` 次连接失败
    pub fn fail_next_dials(&self, count: usize) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    pub async fn ack_log(&self) -> Vec<AckRecord> {
        self.state.inner.lock().await.ack_log.clone()
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.state.inner.lock().await.queues.contains_key(queue)
    }

    /// 等待投递的消息数
    pub async fn ready_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock().await;
        inner.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// 已投递但尚未确认的消息数
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock().await;
        inner.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// 绑定到交换机的队列名
    pub async fn bound_queues(&self, exchange: &str) -> Vec<String> {
        let inner = self.state.inner.lock().await;
        inner
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().map(|b| b.queue.clone()).collect())
            .unwrap_or_default()
    }

    /// 无法路由而被丢弃的消息数
    pub async fn unroutable_count(&self) -> usize {
        self.state.inner.lock().await.unroutable
    }

    /// 不经过通道直接投递一条原始报文，用于注入外部生产者的消息
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        content_type: Option<&str>,
    ) -> GatewayResult<()> {
        let message = StoredMessage {
            body: body.into(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: content_type.map(str::to_string),
            persistent: true,
            redelivered: false,
        };
        let mut inner = self.state.inner.lock().await;
        route_and_enqueue(&mut inner, &self.state, message)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn dial(&self, url: &str) -> GatewayResult<Arc<dyn BrokerSession>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self.state.failing_dials.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_dials.store(failing - 1, Ordering::SeqCst);
            return Err(GatewayError::Connection(
                "内存消息代理拒绝连接: connection refused".to_string(),
            ));
        }

        let session_id = self.state.next_id();
        info!(session_id, url_scheme = url.split(':').next().unwrap_or(""), "内存消息代理连接已建立");
        Ok(Arc::new(InMemorySession {
            state: self.state.clone(),
            id: session_id,
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct InMemorySession {
    state: Arc<BrokerState>,
    id: u64,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn create_channel(&self) -> GatewayResult<Box<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(GatewayError::Connection("connection is closed".to_string()));
        }
        let channel_id = self.state.next_id();
        self.state.inner.lock().await.channels.insert(channel_id, self.id);
        Ok(Box::new(InMemoryChannel {
            state: self.state.clone(),
            session_id: self.id,
            id: channel_id,
            session_connected: self.connected.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> GatewayResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut inner = self.state.inner.lock().await;
        let channel_ids: Vec<u64> = inner
            .channels
            .iter()
            .filter(|(_, session)| **session == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel_id in channel_ids {
            release_channel(&mut inner, &self.state, channel_id);
        }

        // 独占队列随连接一起删除
        let exclusive: Vec<String> = inner
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            inner.queues.remove(name);
            for exchange in inner.exchanges.values_mut() {
                exchange.bindings.retain(|b| &b.queue != name);
            }
        }
        debug!(session_id = self.id, removed_queues = exclusive.len(), "内存消息代理连接已关闭");
        Ok(())
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    session_id: u64,
    id: u64,
    session_connected: Arc<AtomicBool>,
    open: AtomicBool,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> GatewayResult<()> {
        if !self.session_connected.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("connection is closed".to_string()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> GatewayResult<String> {
        self.ensure_open()?;
        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            options.name.clone()
        };

        let mut inner = self.state.inner.lock().await;
        if let Some(existing) = inner.queues.get(&name) {
            if let Some(owner) = existing.owner {
                if owner != self.session_id {
                    return Err(GatewayError::topology(
                        name.clone(),
                        format!("RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"),
                    ));
                }
            }
            for (flag, current, requested) in [
                ("durable", existing.options.durable, options.durable),
                ("exclusive", existing.options.exclusive, options.exclusive),
                ("auto_delete", existing.options.auto_delete, options.auto_delete),
            ] {
                if current != requested {
                    return Err(GatewayError::topology(
                        name.clone(),
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg '{flag}' for queue '{name}': received '{requested}' but current is '{current}'"
                        ),
                    ));
                }
            }
            if existing.options.arguments != options.arguments {
                return Err(GatewayError::topology(
                    name.clone(),
                    format!("PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"),
                ));
            }
            return Ok(name);
        }

        inner.queues.insert(
            name.clone(),
            QueueState {
                options: QueueOptions {
                    name: name.clone(),
                    ..options.clone()
                },
                owner: options.exclusive.then_some(self.session_id),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                unacked: HashMap::new(),
                cursor: 0,
                next_tag: 0,
            },
        );
        debug!(queue = %name, durable = options.durable, exclusive = options.exclusive, "队列已声明");
        Ok(name)
    }

    async fn declare_exchange(&self, options: &ExchangeOptions) -> GatewayResult<()> {
        self.ensure_open()?;
        if options.name.is_empty() || options.name.starts_with("amq.") {
            return Err(GatewayError::topology(
                options.name.clone(),
                format!("ACCESS_REFUSED - exchange name '{}' is reserved", options.name),
            ));
        }

        let mut inner = self.state.inner.lock().await;
        if let Some(existing) = inner.exchanges.get(&options.name) {
            let current = &existing.options;
            if current.kind != options.kind
                || current.durable != options.durable
                || current.auto_delete != options.auto_delete
                || current.internal != options.internal
            {
                return Err(GatewayError::topology(
                    options.name.clone(),
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}': received type '{}' but current is '{}'",
                        options.name, options.kind, current.kind
                    ),
                ));
            }
            return Ok(());
        }

        inner.exchanges.insert(
            options.name.clone(),
            ExchangeState {
                options: options.clone(),
                bindings: Vec::new(),
            },
        );
        debug!(exchange = %options.name, kind = %options.kind, "交换机已声明");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> GatewayResult<()> {
        self.ensure_open()?;
        let mut inner = self.state.inner.lock().await;
        if !inner.queues.contains_key(queue) {
            return Err(GatewayError::topology(
                queue.to_string(),
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        }
        let target = inner.exchanges.get_mut(exchange).ok_or_else(|| {
            GatewayError::topology(exchange.to_string(), format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        if !target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key)
        {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> GatewayResult<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> GatewayResult<DeliveryStream> {
        self.ensure_open()?;
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };

        let mut inner = self.state.inner.lock().await;
        let state = inner.queues.get_mut(queue).ok_or_else(|| {
            GatewayError::topology(queue.to_string(), format!("NOT_FOUND - no queue '{queue}'"))
        })?;
        if matches!(state.owner, Some(owner) if owner != self.session_id) {
            return Err(GatewayError::topology(
                queue.to_string(),
                format!("RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{queue}'"),
            ));
        }
        if state.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !state.consumers.is_empty()) {
            return Err(GatewayError::topology(
                queue.to_string(),
                format!("ACCESS_REFUSED - queue '{queue}' in exclusive use"),
            ));
        }
        if state.consumers.iter().any(|c| c.tag == tag && c.channel_id == self.id) {
            return Err(GatewayError::topology(
                queue.to_string(),
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerSlot {
            id: self.state.next_id(),
            tag: tag.clone(),
            channel_id: self.id,
            sender,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
        });
        debug!(queue, consumer_tag = %tag, "消费者已注册");
        dispatch(&mut inner, &self.state, queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()> {
        self.ensure_open()?;
        let mut inner = self.state.inner.lock().await;
        let mut emptied_auto_delete = Vec::new();
        for (name, queue) in inner.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel_id == self.id));
            if queue.consumers.len() < before && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied_auto_delete.push(name.clone());
            }
        }
        for name in emptied_auto_delete {
            inner.queues.remove(&name);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> GatewayResult<()> {
        self.ensure_open()?;
        let message = StoredMessage {
            body: payload.to_vec(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: properties.content_type.clone(),
            persistent: properties.persistent,
            redelivered: false,
        };
        let mut inner = self.state.inner.lock().await;
        route_and_enqueue(&mut inner, &self.state, message)
    }

    async fn close(&self) -> GatewayResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.state.inner.lock().await;
        release_channel(&mut inner, &self.state, self.id);
        inner.channels.remove(&self.id);
        Ok(())
    }
}

struct InMemoryAcknowledger {
    state: Arc<BrokerState>,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcknowledger {
    async fn settle(self, outcome: AckOutcome) -> GatewayResult<()> {
        let mut inner = self.state.inner.lock().await;

        let dead_letter = {
            let queue = inner.queues.get_mut(&self.queue).ok_or_else(|| {
                GatewayError::Acknowledge(format!("queue '{}' no longer exists", self.queue))
            })?;
            let unacked = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
                GatewayError::Acknowledge(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    self.delivery_tag
                ))
            })?;
            if let Some(slot) = queue.consumers.iter_mut().find(|c| c.id == unacked.consumer_id) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }

            match outcome {
                AckOutcome::Ack => None,
                AckOutcome::Nack { requeue: true } => {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    None
                }
                AckOutcome::Nack { requeue: false } => queue
                    .dead_letter_exchange()
                    .map(|exchange| (exchange, unacked.message)),
            }
        };

        inner.ack_log.push(AckRecord {
            queue: self.queue.clone(),
            delivery_tag: self.delivery_tag,
            outcome,
        });

        if let Some((exchange, mut message)) = dead_letter {
            message.exchange = exchange;
            message.redelivered = false;
            if let Err(e) = route_and_enqueue(&mut inner, &self.state, message) {
                debug!(queue = %self.queue, error = %e, "死信转发失败，消息被丢弃");
            }
        }

        dispatch(&mut inner, &self.state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(self: Box<Self>) -> GatewayResult<()> {
        self.settle(AckOutcome::Ack).await
    }

    async fn nack(self: Box<Self>, requeue: bool) -> GatewayResult<()> {
        self.settle(AckOutcome::Nack { requeue }).await
    }
}

fn route_and_enqueue(
    inner: &mut Inner,
    state: &Arc<BrokerState>,
    message: StoredMessage,
) -> GatewayResult<()> {
    let targets: Vec<String> = if message.exchange.is_empty() {
        inner
            .queues
            .contains_key(&message.routing_key)
            .then(|| message.routing_key.clone())
            .into_iter()
            .collect()
    } else {
        let exchange = inner.exchanges.get(&message.exchange).ok_or_else(|| {
            GatewayError::Publish(format!("NOT_FOUND - no exchange '{}'", message.exchange))
        })?;
        let fanout = exchange.options.kind == "fanout";
        exchange
            .bindings
            .iter()
            .filter(|b| fanout || b.routing_key == message.routing_key)
            .map(|b| b.queue.clone())
            .collect()
    };

    if targets.is_empty() {
        inner.unroutable += 1;
        debug!(exchange = %message.exchange, routing_key = %message.routing_key, "消息无法路由，已丢弃");
        return Ok(());
    }

    for target in targets {
        if let Some(queue) = inner.queues.get_mut(&target) {
            queue.ready.push_back(message.clone());
        }
        dispatch(inner, state, &target);
    }
    Ok(())
}

/// 把等待中的消息分发给有空余 prefetch 窗口的消费者
fn dispatch(inner: &mut Inner, state: &Arc<BrokerState>, queue_name: &str) {
    let Some(queue) = inner.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&i| queue.consumers[i].has_capacity())
        else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        queue.cursor = (index + 1) % count;
        queue.next_tag += 1;
        let delivery_tag = queue.next_tag;

        let delivery = Delivery {
            meta: DeliveryMeta {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                content_type: message.content_type.clone(),
            },
            body: message.body.clone(),
            handle: DeliveryHandle::new(Box::new(InMemoryAcknowledger {
                state: state.clone(),
                queue: queue_name.to_string(),
                delivery_tag,
            })),
        };

        let slot = &mut queue.consumers[index];
        if slot.sender.send(Ok(delivery)).is_err() {
            // 接收端已经丢弃，移除消费者并把消息放回队首
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }
        if slot.no_ack {
            continue;
        }
        slot.in_flight += 1;
        let unacked = Unacked {
            message,
            consumer_id: slot.id,
            channel_id: slot.channel_id,
        };
        queue.unacked.insert(delivery_tag, unacked);
    }
}

/// 通道关闭时移除其消费者，未确认的消息重新入队
fn release_channel(inner: &mut Inner, state: &Arc<BrokerState>, channel_id: u64) {
    let mut touched = Vec::new();
    for (name, queue) in inner.queues.iter_mut() {
        queue.consumers.retain(|c| c.channel_id != channel_id);

        let mut tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            continue;
        }
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        touched.push(name.clone());
    }
    for name in touched {
        dispatch(inner, state, &name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn open_channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerSession>, Box<dyn BrokerChannel>) {
        let session = broker.dial("memory://localhost/").await.unwrap();
        let channel = session.create_channel().await.unwrap();
        (session, channel)
    }

    fn work_queue(name: &str) -> QueueOptions {
        QueueOptions {
            name: name.to_string(),
            ..QueueOptions::default()
        }
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
            .unwrap()
    }

    async fn nothing_pending(stream: &mut DeliveryStream) -> bool {
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_declare_queue_is_idempotent_and_checks_flags() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = open_channel(&broker).await;

        assert_eq!(channel.declare_queue(&work_queue("task-added")).await.unwrap(), "task-added");
        assert_eq!(channel.declare_queue(&work_queue("task-added")).await.unwrap(), "task-added");

        let mut mismatched = work_queue("task-added");
        mismatched.durable = false;
        let err = channel.declare_queue(&mismatched).await.unwrap_err();
        assert!(matches!(err, GatewayError::TopologyDeclaration { .. }));
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }

    #[tokio::test]
    async fn test_server_named_exclusive_queue() {
        let broker = InMemoryBroker::new();
        let (session, channel) = open_channel(&broker).await;

        let options = QueueOptions {
            name: String::new(),
            durable: false,
            exclusive: true,
            ..QueueOptions::default()
        };
        let name = channel.declare_queue(&options).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let (_other_session, other_channel) = open_channel(&broker).await;
        let err = other_channel
            .consume(&name, "intruder", ConsumeOptions::default())
            .await
            .err()
            .expect("consume should fail");
        assert!(err.to_string().contains("RESOURCE_LOCKED"));

        session.close().await.unwrap();
        assert!(!broker.queue_exists(&name).await);
    }

    #[tokio::test]
    async fn test_fanout_routing() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = open_channel(&broker).await;
        channel
            .declare_exchange(&ExchangeOptions {
                name: "task-cancelled".to_string(),
                ..ExchangeOptions::default()
            })
            .await
            .unwrap();
        for queue in ["a", "b"] {
            channel.declare_queue(&work_queue(queue)).await.unwrap();
            channel.bind_queue(queue, "task-cancelled", "").await.unwrap();
        }

        channel
            .publish("task-cancelled", "ignored", b"payload", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.ready_count("a").await, 1);
        assert_eq!(broker.ready_count("b").await, 1);

        let err = channel
            .publish("missing", "", b"payload", &MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Publish(_)));
    }

    #[tokio::test]
    async fn test_prefetch_window_limits_in_flight() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = open_channel(&broker).await;
        channel.declare_queue(&work_queue("slice-added")).await.unwrap();
        channel.set_prefetch(1).await.unwrap();

        for body in ["one", "two"] {
            broker.publish_raw("", "slice-added", body, None).await.unwrap();
        }

        let mut stream = channel
            .consume("slice-added", "worker", ConsumeOptions::default())
            .await
            .unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.body, b"one");
        assert!(nothing_pending(&mut stream).await);
        assert_eq!(broker.unacked_count("slice-added").await, 1);

        first.handle.ack().await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.body, b"two");
        second.handle.ack().await.unwrap();
        assert_eq!(broker.unacked_count("slice-added").await, 0);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = open_channel(&broker).await;
        channel.declare_queue(&work_queue("task-added")).await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        broker.publish_raw("", "task-added", "x", None).await.unwrap();

        let mut stream = channel
            .consume("task-added", "worker", ConsumeOptions::default())
            .await
            .unwrap();
        let first = next(&mut stream).await;
        assert!(!first.meta.redelivered);
        first.handle.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert!(again.meta.redelivered);
        again.handle.nack(false).await.unwrap();

        let log = broker.ack_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].outcome, AckOutcome::Nack { requeue: true });
        assert_eq!(log[1].outcome, AckOutcome::Nack { requeue: false });
        assert_eq!(broker.ready_count("task-added").await, 0);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_when_configured() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = open_channel(&broker).await;
        channel
            .declare_exchange(&ExchangeOptions {
                name: "gateway-dlx".to_string(),
                ..ExchangeOptions::default()
            })
            .await
            .unwrap();
        channel.declare_queue(&work_queue("dead-letters")).await.unwrap();
        channel.bind_queue("dead-letters", "gateway-dlx", "").await.unwrap();

        let mut options = work_queue("task-added");
        options.arguments.insert(
            "x-dead-letter-exchange".to_string(),
            ArgValue::Text("gateway-dlx".to_string()),
        );
        channel.declare_queue(&options).await.unwrap();
        broker.publish_raw("", "task-added", "bad", None).await.unwrap();

        let mut stream = channel
            .consume("task-added", "worker", ConsumeOptions::default())
            .await
            .unwrap();
        next(&mut stream).await.handle.nack(false).await.unwrap();
        assert_eq!(broker.ready_count("dead-letters").await, 1);
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (session, channel) = open_channel(&broker).await;
        channel.declare_queue(&work_queue("slice-completed")).await.unwrap();
        broker.publish_raw("", "slice-completed", "x", None).await.unwrap();

        let mut stream = channel
            .consume("slice-completed", "worker", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = next(&mut stream).await;
        channel.close().await.unwrap();
        assert_eq!(broker.ready_count("slice-completed").await, 1);
        assert!(delivery.handle.ack().await.is_err());

        let other = session.create_channel().await.unwrap();
        let mut stream = other
            .consume("slice-completed", "worker-2", ConsumeOptions::default())
            .await
            .unwrap();
        assert!(next(&mut stream).await.meta.redelivered);
    }

    #[tokio::test]
    async fn test_failing_dials() {
        let broker = InMemoryBroker::new();
        broker.fail_next_dials(1);
        assert!(broker.dial("memory://").await.is_err());
        assert!(broker.dial("memory://").await.is_ok());
        assert_eq!(broker.dial_count(), 2);
    }
}
