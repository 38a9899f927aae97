//! JSON 线上格式
//!
//! 字段名为 snake_case，不做 Schema 校验。`TaskAdded` 显式携带 priority，
//! 缺省时从 file 的端口推导。标准流输出按 `index` 排序还原。

use gateway_domain::{
    Event, EventKind, Priority, SliceAddedEvent, SliceCompletedEvent, StdStream, StdStreamLine,
    TaskAddedEvent, TaskCancelledEvent, TaskCompletedEvent,
};
use gateway_errors::{GatewayError, GatewayResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct TaskAddedJson {
    job_id: String,
    file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
    slice_size: u32,
    #[serde(default)]
    file_hash: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobOnlyJson {
    job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SliceAddedJson {
    job_id: String,
    slice_nr: u32,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamLineJson {
    fd: u8,
    line: String,
    #[serde(default)]
    index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SliceCompletedJson {
    job_id: String,
    slice_nr: u32,
    #[serde(default)]
    file_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    std_streams: Vec<StreamLineJson>,
}

pub fn encode(event: &Event) -> GatewayResult<String> {
    let encoded = match event {
        Event::TaskAdded(e) => serde_json::to_string(&TaskAddedJson {
            job_id: e.job_id.clone(),
            file: e.file.clone(),
            priority: Some(e.priority.value()),
            slice_size: e.slice_size,
            file_hash: e.file_hash.clone(),
            args: e.args.clone(),
        }),
        Event::TaskCompleted(e) => serde_json::to_string(&JobOnlyJson {
            job_id: e.job_id.clone(),
        }),
        Event::TaskCancelled(e) => serde_json::to_string(&JobOnlyJson {
            job_id: e.job_id.clone(),
        }),
        Event::SliceAdded(e) => serde_json::to_string(&SliceAddedJson {
            job_id: e.job_id.clone(),
            slice_nr: e.slice_nr,
            args: e.args.clone(),
        }),
        Event::SliceCompleted(e) => serde_json::to_string(&SliceCompletedJson {
            job_id: e.job_id.clone(),
            slice_nr: e.slice_nr,
            file_hash: e.file_hash.clone(),
            std_streams: e
                .std_streams
                .iter()
                .enumerate()
                .map(|(index, l)| StreamLineJson {
                    fd: l.stream.fd(),
                    line: l.line.clone(),
                    index: index as u64,
                })
                .collect(),
        }),
    };
    encoded.map_err(|e| GatewayError::Encode(format!("{}: {e}", event.kind())))
}

pub fn decode(kind: EventKind, raw: &str) -> GatewayResult<Event> {
    let event = match kind {
        EventKind::TaskAdded => {
            let dto: TaskAddedJson = from_json(kind, raw)?;
            let mut event =
                TaskAddedEvent::new(dto.job_id, dto.file, dto.slice_size, dto.file_hash, dto.args);
            if let Some(priority) = dto.priority {
                event.priority = Priority::new(priority);
            }
            Event::TaskAdded(event)
        }
        EventKind::TaskCompleted => {
            let dto: JobOnlyJson = from_json(kind, raw)?;
            Event::TaskCompleted(TaskCompletedEvent { job_id: dto.job_id })
        }
        EventKind::TaskCancelled => {
            let dto: JobOnlyJson = from_json(kind, raw)?;
            Event::TaskCancelled(TaskCancelledEvent { job_id: dto.job_id })
        }
        EventKind::SliceAdded => {
            let dto: SliceAddedJson = from_json(kind, raw)?;
            Event::SliceAdded(SliceAddedEvent {
                job_id: dto.job_id,
                slice_nr: dto.slice_nr,
                args: dto.args,
            })
        }
        EventKind::SliceCompleted => {
            let mut dto: SliceCompletedJson = from_json(kind, raw)?;
            dto.std_streams.sort_by_key(|l| l.index);
            let std_streams = dto
                .std_streams
                .into_iter()
                .map(|l| Ok(StdStreamLine::new(StdStream::try_from(l.fd)?, l.line)))
                .collect::<GatewayResult<Vec<_>>>()?;
            Event::SliceCompleted(SliceCompletedEvent {
                job_id: dto.job_id,
                slice_nr: dto.slice_nr,
                file_hash: dto.file_hash,
                std_streams,
            })
        }
    };
    Ok(event)
}

fn from_json<T: DeserializeOwned>(kind: EventKind, raw: &str) -> GatewayResult<T> {
    serde_json::from_str(raw).map_err(|e| GatewayError::decode(format!("{kind}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_ID: &str = "620b8251-52a1-4ecd-8adc-4fb280214bba";

    #[test]
    fn test_decode_task_added() {
        let json = r#"
            {
                "file": "0/path/to/file.ext",
                "args": ["arg1", "arg with space"],
                "job_id": "620b8251-52a1-4ecd-8adc-4fb280214bba",
                "file_hash": "b8934ef001960cafc224be9f1e1ca82c",
                "priority": 1,
                "slice_size": 120
            }
        "#;
        let expected = Event::TaskAdded(TaskAddedEvent {
            job_id: JOB_ID.to_string(),
            file: "0/path/to/file.ext".to_string(),
            priority: Priority::new(1),
            slice_size: 120,
            file_hash: "b8934ef001960cafc224be9f1e1ca82c".to_string(),
            args: vec!["arg1".to_string(), "arg with space".to_string()],
        });
        assert_eq!(decode(EventKind::TaskAdded, json).unwrap(), expected);
    }

    #[test]
    fn test_missing_priority_falls_back_to_locator() {
        let json = r#"{"job_id":"j","file":"smb://nas:42/a.mkv","slice_size":1}"#;
        match decode(EventKind::TaskAdded, json).unwrap() {
            Event::TaskAdded(event) => assert_eq!(event.priority.value(), 42),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_slice_added_and_completed() {
        let json = r#"{"job_id":"620b8251-52a1-4ecd-8adc-4fb280214bba","args":["arg1","arg with space"],"slice_nr":34}"#;
        assert_eq!(
            decode(EventKind::SliceAdded, json).unwrap(),
            Event::SliceAdded(SliceAddedEvent {
                job_id: JOB_ID.to_string(),
                slice_nr: 34,
                args: vec!["arg1".to_string(), "arg with space".to_string()],
            })
        );

        let json = r#"{"job_id":"620b8251-52a1-4ecd-8adc-4fb280214bba","slice_nr":34,"file_hash":"b8934ef001960cafc224be9f1e1ca82c"}"#;
        assert_eq!(
            decode(EventKind::SliceCompleted, json).unwrap(),
            Event::SliceCompleted(SliceCompletedEvent {
                job_id: JOB_ID.to_string(),
                slice_nr: 34,
                file_hash: "b8934ef001960cafc224be9f1e1ca82c".to_string(),
                std_streams: vec![],
            })
        );
    }

    #[test]
    fn test_std_streams_ordered_by_index() {
        let json = r#"{"job_id":"j","slice_nr":1,"std_streams":[
            {"fd":2,"line":"second","index":1},
            {"fd":1,"line":"first","index":0}
        ]}"#;
        match decode(EventKind::SliceCompleted, json).unwrap() {
            Event::SliceCompleted(event) => assert_eq!(
                event.std_streams,
                vec![StdStreamLine::stdout("first"), StdStreamLine::stderr("second")]
            ),
            other => panic!("unexpected event {other:?}"),
        }

        let json = r#"{"job_id":"j","slice_nr":1,"std_streams":[{"fd":7,"line":"x","index":0}]}"#;
        assert!(matches!(
            decode(EventKind::SliceCompleted, json),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_uses_snake_case() {
        let event = Event::TaskCancelled(TaskCancelledEvent {
            job_id: JOB_ID.to_string(),
        });
        assert_eq!(encode(&event).unwrap(), format!(r#"{{"job_id":"{JOB_ID}"}}"#));
    }
}
