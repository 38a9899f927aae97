//! 线上格式适配层
//!
//! 每个线上格式版本一个模块，负责在领域事件和报文之间转换。
//! 新增格式版本时在这里加模块，领域模型保持不变。

pub mod json;
pub mod xml_v1;
