//! XML v1 线上格式
//!
//! 根元素名即事件名，字段使用大驼峰元素名。参数列表为 `Args/Arg*`，
//! 标准流输出为 `StdStreams/L*`，`fd` 作为属性。空列表不输出。
//!
//! 标量字段由 serde 解码；列表元素的文本按原样从文档树读取，
//! 首尾空白和纯空白内容都保留。

use gateway_domain::{
    Event, EventKind, Priority, SliceAddedEvent, SliceCompletedEvent, StdStream, StdStreamLine,
    TaskAddedEvent, TaskCancelledEvent, TaskCompletedEvent,
};
use gateway_errors::{GatewayError, GatewayResult};
use quick_xml::events::Event as XmlEvent;
use roxmltree::{Document, Node};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct ArgsXml {
    #[serde(rename = "Arg")]
    items: Vec<String>,
}

impl ArgsXml {
    fn wrap(args: &[String]) -> Option<Self> {
        (!args.is_empty()).then(|| Self {
            items: args.to_vec(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskAddedXml {
    #[serde(rename = "JobId")]
    job_id: String,
    #[serde(rename = "File")]
    file: String,
    #[serde(rename = "SliceSize")]
    slice_size: u32,
    #[serde(rename = "FileHash")]
    file_hash: String,
    #[serde(rename = "Priority", default, skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
    #[serde(rename = "Args", skip_deserializing, skip_serializing_if = "Option::is_none")]
    args: Option<ArgsXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobOnlyXml {
    #[serde(rename = "JobId")]
    job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SliceAddedXml {
    #[serde(rename = "JobId")]
    job_id: String,
    #[serde(rename = "SliceNr")]
    slice_nr: u32,
    #[serde(rename = "Args", skip_deserializing, skip_serializing_if = "Option::is_none")]
    args: Option<ArgsXml>,
}

#[derive(Debug, Serialize)]
struct StreamLineXml {
    #[serde(rename = "@fd")]
    fd: u8,
    #[serde(rename = "$text")]
    line: String,
}

#[derive(Debug, Serialize)]
struct StdStreamsXml {
    #[serde(rename = "L")]
    lines: Vec<StreamLineXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SliceCompletedXml {
    #[serde(rename = "JobId")]
    job_id: String,
    #[serde(rename = "FileHash", default, skip_serializing_if = "Option::is_none")]
    file_hash: Option<String>,
    #[serde(rename = "SliceNr")]
    slice_nr: u32,
    #[serde(rename = "StdStreams", skip_deserializing, skip_serializing_if = "Option::is_none")]
    std_streams: Option<StdStreamsXml>,
}

/// 把事件编码为 XML v1 文本，不做 Schema 校验
pub fn encode(event: &Event) -> GatewayResult<String> {
    let root = event.kind().element_name();
    match event {
        Event::TaskAdded(e) => to_xml(
            root,
            &TaskAddedXml {
                job_id: e.job_id.clone(),
                file: e.file.clone(),
                slice_size: e.slice_size,
                file_hash: e.file_hash.clone(),
                priority: (e.priority != Priority::from_locator(&e.file)).then(|| e.priority.value()),
                args: ArgsXml::wrap(&e.args),
            },
        ),
        Event::TaskCompleted(e) => to_xml(
            root,
            &JobOnlyXml {
                job_id: e.job_id.clone(),
            },
        ),
        Event::TaskCancelled(e) => to_xml(
            root,
            &JobOnlyXml {
                job_id: e.job_id.clone(),
            },
        ),
        Event::SliceAdded(e) => to_xml(
            root,
            &SliceAddedXml {
                job_id: e.job_id.clone(),
                slice_nr: e.slice_nr,
                args: ArgsXml::wrap(&e.args),
            },
        ),
        Event::SliceCompleted(e) => to_xml(
            root,
            &SliceCompletedXml {
                job_id: e.job_id.clone(),
                file_hash: (!e.file_hash.is_empty()).then(|| e.file_hash.clone()),
                slice_nr: e.slice_nr,
                std_streams: (!e.std_streams.is_empty()).then(|| StdStreamsXml {
                    lines: e
                        .std_streams
                        .iter()
                        .map(|l| StreamLineXml {
                            fd: l.stream.fd(),
                            line: l.line.clone(),
                        })
                        .collect(),
                }),
            },
        ),
    }
}

/// 按给定变体做结构化解码，调用方负责事先完成 Schema 校验
pub fn decode(kind: EventKind, raw: &str) -> GatewayResult<Event> {
    let event = match kind {
        EventKind::TaskAdded => {
            let dto: TaskAddedXml = from_xml(kind, raw)?;
            let document = parse_document(kind, raw)?;
            let mut event = TaskAddedEvent::new(
                dto.job_id,
                dto.file,
                dto.slice_size,
                dto.file_hash,
                list_texts(&document, "Args", "Arg"),
            );
            if let Some(priority) = dto.priority {
                event.priority = Priority::new(priority);
            }
            Event::TaskAdded(event)
        }
        EventKind::TaskCompleted => {
            let dto: JobOnlyXml = from_xml(kind, raw)?;
            Event::TaskCompleted(TaskCompletedEvent { job_id: dto.job_id })
        }
        EventKind::TaskCancelled => {
            let dto: JobOnlyXml = from_xml(kind, raw)?;
            Event::TaskCancelled(TaskCancelledEvent { job_id: dto.job_id })
        }
        EventKind::SliceAdded => {
            let dto: SliceAddedXml = from_xml(kind, raw)?;
            let document = parse_document(kind, raw)?;
            Event::SliceAdded(SliceAddedEvent {
                job_id: dto.job_id,
                slice_nr: dto.slice_nr,
                args: list_texts(&document, "Args", "Arg"),
            })
        }
        EventKind::SliceCompleted => {
            let dto: SliceCompletedXml = from_xml(kind, raw)?;
            let document = parse_document(kind, raw)?;
            let std_streams = list_items(&document, "StdStreams", "L")
                .map(|node| {
                    let fd = node
                        .attribute("fd")
                        .and_then(|fd| fd.trim().parse::<u8>().ok())
                        .ok_or_else(|| GatewayError::decode(format!("{kind}: L element without a valid fd")))?;
                    Ok(StdStreamLine::new(StdStream::try_from(fd)?, raw_text(node)))
                })
                .collect::<GatewayResult<Vec<_>>>()?;
            Event::SliceCompleted(SliceCompletedEvent {
                job_id: dto.job_id,
                slice_nr: dto.slice_nr,
                file_hash: dto.file_hash.unwrap_or_default(),
                std_streams,
            })
        }
    };
    Ok(event)
}

/// 读取根元素的本地名
pub fn root_element(raw: &str) -> GatewayResult<String> {
    let mut reader = quick_xml::Reader::from_str(raw);
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(start)) | Ok(XmlEvent::Empty(start)) => {
                return Ok(String::from_utf8_lossy(start.local_name().as_ref()).into_owned())
            }
            Ok(XmlEvent::Eof) => {
                return Err(GatewayError::decode("XML document has no root element"))
            }
            Ok(_) => {}
            Err(e) => {
                return Err(GatewayError::decode(format!(
                    "failed to read the XML root element: {e}"
                )))
            }
        }
    }
}

fn to_xml<T: Serialize>(root: &str, value: &T) -> GatewayResult<String> {
    quick_xml::se::to_string_with_root(root, value)
        .map_err(|e| GatewayError::Encode(format!("{root}: {e}")))
}

fn from_xml<T: DeserializeOwned>(kind: EventKind, raw: &str) -> GatewayResult<T> {
    quick_xml::de::from_str(raw).map_err(|e| GatewayError::decode(format!("{kind}: {e}")))
}

fn parse_document(kind: EventKind, raw: &str) -> GatewayResult<Document<'_>> {
    Document::parse(raw).map_err(|e| GatewayError::decode(format!("{kind}: {e}")))
}

/// 根元素下 `list` 容器中的全部 `item` 元素，按文档顺序
fn list_items<'a, 'input: 'a>(
    document: &'a Document<'input>,
    list: &'static str,
    item: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    document
        .root_element()
        .children()
        .filter(move |node| node.has_tag_name(list))
        .flat_map(|node| node.children())
        .filter(move |node| node.has_tag_name(item))
}

fn list_texts(document: &Document<'_>, list: &'static str, item: &'static str) -> Vec<String> {
    list_items(document, list, item).map(raw_text).collect()
}

/// 元素内的全部字符数据，实体已展开，空白不做处理
fn raw_text(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_ID: &str = "620b8251-52a1-4ecd-8adc-4fb280214bba";

    #[test]
    fn test_encode_slice_added_layout() {
        let event = Event::SliceAdded(SliceAddedEvent {
            job_id: JOB_ID.to_string(),
            slice_nr: 34,
            args: vec!["arg1".to_string(), "arg with space".to_string()],
        });
        let xml = encode(&event).unwrap();

        assert!(xml.starts_with("<SliceAdded>"));
        assert!(xml.contains(&format!("<JobId>{JOB_ID}</JobId>")));
        assert!(xml.contains("<SliceNr>34</SliceNr>"));
        assert!(xml.contains("<Args><Arg>arg1</Arg><Arg>arg with space</Arg></Args>"));
    }

    #[test]
    fn test_empty_lists_are_omitted() {
        let event = Event::SliceCompleted(SliceCompletedEvent {
            job_id: JOB_ID.to_string(),
            slice_nr: 0,
            file_hash: String::new(),
            std_streams: vec![],
        });
        let xml = encode(&event).unwrap();
        assert!(!xml.contains("StdStreams"));
        assert!(!xml.contains("FileHash"));

        let event = Event::TaskAdded(TaskAddedEvent::new(JOB_ID, "0/path/to/file.ext", 120, "abc", vec![]));
        assert!(!encode(&event).unwrap().contains("Args"));
    }

    #[test]
    fn test_std_stream_lines() {
        let xml = format!(
            r#"<SliceCompleted><JobId>{JOB_ID}</JobId><SliceNr>2</SliceNr><StdStreams><L fd="1">frame=1</L><L fd="2">warning &amp; more</L></StdStreams></SliceCompleted>"#
        );
        match decode(EventKind::SliceCompleted, &xml).unwrap() {
            Event::SliceCompleted(event) => {
                assert_eq!(
                    event.std_streams,
                    vec![
                        StdStreamLine::stdout("frame=1"),
                        StdStreamLine::stderr("warning & more"),
                    ]
                );
                assert_eq!(event.file_hash, "");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_task_added_priority_from_file() {
        let xml = format!(
            "<TaskAdded><JobId>{JOB_ID}</JobId><File>nfs://storage:8080/movie.mkv</File><SliceSize>120</SliceSize><FileHash>b8934ef001960cafc224be9f1e1ca82c</FileHash></TaskAdded>"
        );
        match decode(EventKind::TaskAdded, &xml).unwrap() {
            Event::TaskAdded(event) => {
                assert_eq!(event.priority.value(), 8080);
                assert!(event.args.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_list_text_keeps_surrounding_whitespace() {
        let xml = format!(
            "<SliceAdded><JobId>{JOB_ID}</JobId><SliceNr>1</SliceNr><Args><Arg> scale=1280:-1 </Arg><Arg> </Arg><Arg/><Arg>a &amp; b</Arg></Args></SliceAdded>"
        );
        match decode(EventKind::SliceAdded, &xml).unwrap() {
            Event::SliceAdded(event) => assert_eq!(event.args, vec![" scale=1280:-1 ", " ", "", "a & b"]),
            other => panic!("unexpected event {other:?}"),
        }

        let xml = format!(
            "<SliceCompleted><JobId>{JOB_ID}</JobId><SliceNr>2</SliceNr><StdStreams><L fd=\"2\">  Duration: 00:01:00.00</L><L fd=\"1\">\t</L></StdStreams></SliceCompleted>"
        );
        match decode(EventKind::SliceCompleted, &xml).unwrap() {
            Event::SliceCompleted(event) => assert_eq!(
                event.std_streams,
                vec![
                    StdStreamLine::stderr("  Duration: 00:01:00.00"),
                    StdStreamLine::stdout("\t"),
                ]
            ),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_priority_element_only_when_not_derived() {
        let derived = TaskAddedEvent::new(JOB_ID, "nfs://storage:8080/movie.mkv", 120, "h", vec![]);
        assert!(!encode(&derived.clone().into()).unwrap().contains("Priority"));

        let mut explicit = derived;
        explicit.priority = Priority::new(1);
        let xml = encode(&explicit.clone().into()).unwrap();
        assert!(xml.contains("<FileHash>h</FileHash><Priority>1</Priority>"));
        assert_eq!(decode(EventKind::TaskAdded, &xml).unwrap(), Event::TaskAdded(explicit));
    }

    #[test]
    fn test_wrong_shape_is_decode_error() {
        let err = decode(EventKind::SliceAdded, "<SliceAdded><JobId>x</JobId><SliceNr>abc</SliceNr></SliceAdded>")
            .unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn test_root_element() {
        assert_eq!(
            root_element("<?xml version=\"1.0\"?>\n<!-- c --><TaskCancelled><JobId/></TaskCancelled>").unwrap(),
            "TaskCancelled"
        );
        assert_eq!(root_element("<TaskCompleted/>").unwrap(), "TaskCompleted");
        assert!(root_element("   ").is_err());
    }
}
