//! Clustercode 事件网关的领域模型
//!
//! 这里的类型只承载事件数据本身，不包含任何消息代理相关的 I/O 能力。
//! 线上格式（XML/JSON）的映射在 infrastructure 的 wire 适配层完成。

pub mod events;
pub mod messaging;
pub mod value_objects;

pub use events::*;
pub use gateway_errors::{GatewayError, GatewayResult};
pub use messaging::*;
pub use value_objects::*;
