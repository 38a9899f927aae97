use std::fmt;

use gateway_errors::GatewayError;

/// 消费回调对一条投递做出的最终处理决定
///
/// 每条投递恰好对应一个决定。回调必须返回该值，
/// 因此"忘记确认"在类型层面无法表达。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionDecision {
    /// 处理完成，消息从队列移除
    Accept,
    /// 处理失败，丢弃消息（若队列配置了死信交换机则进入死信）
    Reject,
    /// 处理失败，重新入队等待再次投递
    RejectAndRequeue,
}

impl CompletionDecision {
    /// 历史线上协议中使用的整数编码
    pub fn code(&self) -> i32 {
        match self {
            CompletionDecision::Accept => 0,
            CompletionDecision::Reject => 1,
            CompletionDecision::RejectAndRequeue => 2,
        }
    }

    /// 从整数编码还原决定
    ///
    /// # Panics
    ///
    /// 编码不在 0..=2 内时 panic。这只会由调用方的逻辑错误引起。
    pub fn from_code(code: i32) -> Self {
        match Self::try_from(code) {
            Ok(decision) => decision,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionDecision::Accept => "accept",
            CompletionDecision::Reject => "reject",
            CompletionDecision::RejectAndRequeue => "reject_requeue",
        }
    }
}

impl TryFrom<i32> for CompletionDecision {
    type Error = GatewayError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CompletionDecision::Accept),
            1 => Ok(CompletionDecision::Reject),
            2 => Ok(CompletionDecision::RejectAndRequeue),
            other => Err(GatewayError::ProtocolViolation(format!(
                "completion decision code {other} is not expected here"
            ))),
        }
    }
}

impl fmt::Display for CompletionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_codes() {
        for decision in [
            CompletionDecision::Accept,
            CompletionDecision::Reject,
            CompletionDecision::RejectAndRequeue,
        ] {
            assert_eq!(CompletionDecision::from_code(decision.code()), decision);
        }
    }

    #[test]
    fn test_unknown_code_is_protocol_violation() {
        let err = CompletionDecision::try_from(3).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation(_)));
    }

    #[test]
    #[should_panic(expected = "completion decision code -1")]
    fn test_from_code_fails_loudly() {
        let _ = CompletionDecision::from_code(-1);
    }
}
