use gateway_domain::CompletionDecision;
use gateway_errors::GatewayResult;
use tracing::debug;

use crate::broker::DeliveryHandle;
use crate::metrics;

/// 把处理决定映射为对消息代理的确认调用
///
/// 每个决定恰好产生一次确认调用：
/// `Accept` -> ack，`Reject` -> nack 不重新入队，`RejectAndRequeue` -> nack 并重新入队。
pub struct AcknowledgementPolicy;

impl AcknowledgementPolicy {
    pub async fn apply(decision: CompletionDecision, handle: DeliveryHandle, queue: &str) -> GatewayResult<()> {
        match decision {
            CompletionDecision::Accept => handle.ack().await?,
            CompletionDecision::Reject => handle.nack(false).await?,
            CompletionDecision::RejectAndRequeue => handle.nack(true).await?,
        }
        metrics::record_acknowledged(queue, decision);
        debug!(queue, decision = %decision, "投递已确认");
        Ok(())
    }

    /// 整数编码的决定；编码越界属于调用方逻辑错误，直接 panic
    pub async fn apply_code(code: i32, handle: DeliveryHandle, queue: &str) -> GatewayResult<()> {
        Self::apply(CompletionDecision::from_code(code), handle, queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Acknowledger;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Acknowledger for Recorder {
        async fn ack(self: Box<Self>) -> GatewayResult<()> {
            self.calls.lock().unwrap().push("ack".to_string());
            Ok(())
        }

        async fn nack(self: Box<Self>, requeue: bool) -> GatewayResult<()> {
            self.calls.lock().unwrap().push(format!("nack(requeue={requeue})"));
            Ok(())
        }
    }

    async fn calls_for(decision: CompletionDecision) -> Vec<String> {
        let recorder = Recorder::default();
        let handle = DeliveryHandle::new(Box::new(recorder.clone()));
        AcknowledgementPolicy::apply(decision, handle, "task-added").await.unwrap();
        let calls = recorder.calls.lock().unwrap().clone();
        calls
    }

    #[tokio::test]
    async fn test_each_decision_maps_to_exactly_one_call() {
        assert_eq!(calls_for(CompletionDecision::Accept).await, vec!["ack"]);
        assert_eq!(calls_for(CompletionDecision::Reject).await, vec!["nack(requeue=false)"]);
        assert_eq!(
            calls_for(CompletionDecision::RejectAndRequeue).await,
            vec!["nack(requeue=true)"]
        );
    }

    #[tokio::test]
    async fn test_apply_code() {
        let recorder = Recorder::default();
        let handle = DeliveryHandle::new(Box::new(recorder.clone()));
        AcknowledgementPolicy::apply_code(2, handle, "task-added").await.unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["nack(requeue=true)"]);
    }

    #[tokio::test]
    #[should_panic(expected = "completion decision code 7")]
    async fn test_apply_code_out_of_range_panics() {
        let handle = DeliveryHandle::new(Box::new(Recorder::default()));
        let _ = AcknowledgementPolicy::apply_code(7, handle, "task-added").await;
    }
}
