//! 领域事件
//!
//! 转码流水线的生命周期事件。所有变体都携带 JobID，其余字段因变体而异。

use std::fmt;
use std::str::FromStr;

use gateway_errors::GatewayError;
use uuid::Uuid;

use crate::value_objects::{Priority, StdStreamLine};

/// 事件类别，同时决定 XML 根元素名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskAdded,
    TaskCompleted,
    TaskCancelled,
    SliceAdded,
    SliceCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::TaskAdded,
        EventKind::TaskCompleted,
        EventKind::TaskCancelled,
        EventKind::SliceAdded,
        EventKind::SliceCompleted,
    ];

    /// XML 根元素名
    pub fn element_name(&self) -> &'static str {
        match self {
            EventKind::TaskAdded => "TaskAdded",
            EventKind::TaskCompleted => "TaskCompleted",
            EventKind::TaskCancelled => "TaskCancelled",
            EventKind::SliceAdded => "SliceAdded",
            EventKind::SliceCompleted => "SliceCompleted",
        }
    }

    /// 路由/配置中使用的短横线形式，同时也是默认队列名
    pub fn slug(&self) -> &'static str {
        match self {
            EventKind::TaskAdded => "task-added",
            EventKind::TaskCompleted => "task-completed",
            EventKind::TaskCancelled => "task-cancelled",
            EventKind::SliceAdded => "slice-added",
            EventKind::SliceCompleted => "slice-completed",
        }
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.element_name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name())
    }
}

impl FromStr for EventKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug() == s || kind.element_name() == s)
            .ok_or_else(|| {
                GatewayError::decode(format!(
                    "unknown event kind: {s}, supported kinds: task-added, task-completed, task-cancelled, slice-added, slice-completed"
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAddedEvent {
    pub job_id: String,
    /// 源文件定位符
    pub file: String,
    pub priority: Priority,
    pub slice_size: u32,
    pub file_hash: String,
    pub args: Vec<String>,
}

impl TaskAddedEvent {
    /// 创建任务事件，优先级取自定位符端口
    pub fn new(
        job_id: impl Into<String>,
        file: impl Into<String>,
        slice_size: u32,
        file_hash: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let file = file.into();
        Self {
            job_id: job_id.into(),
            priority: Priority::from_locator(&file),
            file,
            slice_size,
            file_hash: file_hash.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletedEvent {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCancelledEvent {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceAddedEvent {
    pub job_id: String,
    pub slice_nr: u32,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceCompletedEvent {
    pub job_id: String,
    pub slice_nr: u32,
    pub file_hash: String,
    pub std_streams: Vec<StdStreamLine>,
}

/// 所有生命周期事件的标签联合
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TaskAdded(TaskAddedEvent),
    TaskCompleted(TaskCompletedEvent),
    TaskCancelled(TaskCancelledEvent),
    SliceAdded(SliceAddedEvent),
    SliceCompleted(SliceCompletedEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TaskAdded(_) => EventKind::TaskAdded,
            Event::TaskCompleted(_) => EventKind::TaskCompleted,
            Event::TaskCancelled(_) => EventKind::TaskCancelled,
            Event::SliceAdded(_) => EventKind::SliceAdded,
            Event::SliceCompleted(_) => EventKind::SliceCompleted,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Event::TaskAdded(e) => &e.job_id,
            Event::TaskCompleted(e) => &e.job_id,
            Event::TaskCancelled(e) => &e.job_id,
            Event::SliceAdded(e) => &e.job_id,
            Event::SliceCompleted(e) => &e.job_id,
        }
    }

    /// JobID 按约定应为 UUID，这里不强制，只在需要时解析
    pub fn job_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.job_id()).ok()
    }
}

/// 单个事件变体与 [`Event`] 之间的转换，用于按队列声明的类型解码
pub trait EventVariant: Sized + Send + Sync + fmt::Debug + 'static {
    const KIND: EventKind;

    fn into_event(self) -> Event;

    /// 变体不匹配时原样返回事件
    fn from_event(event: Event) -> Result<Self, Event>;
}

macro_rules! event_variant {
    ($ty:ident, $variant:ident) => {
        impl EventVariant for $ty {
            const KIND: EventKind = EventKind::$variant;

            fn into_event(self) -> Event {
                Event::$variant(self)
            }

            fn from_event(event: Event) -> Result<Self, Event> {
                match event {
                    Event::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Event {
            fn from(value: $ty) -> Self {
                Event::$variant(value)
            }
        }
    };
}

event_variant!(TaskAddedEvent, TaskAdded);
event_variant!(TaskCompletedEvent, TaskCompleted);
event_variant!(TaskCancelledEvent, TaskCancelled);
event_variant!(SliceAddedEvent, SliceAdded);
event_variant!(SliceCompletedEvent, SliceCompleted);
