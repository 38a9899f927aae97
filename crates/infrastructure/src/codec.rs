//! 事件编解码
//!
//! XML 报文先经过 [`SchemaValidator`] 校验，通过后才做结构化解码；
//! 两类失败分别报告为 `Validation` 和 `Decode` 错误。JSON 只做结构化解码。

use gateway_config::WireFormat;
use gateway_domain::{Event, EventKind, EventVariant};
use gateway_errors::{GatewayError, GatewayResult};

use crate::schema::SchemaValidator;
use crate::wire;

#[derive(Debug, Clone)]
pub struct EventCodec {
    schema: SchemaValidator,
}

impl EventCodec {
    pub fn new(schema: SchemaValidator) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &SchemaValidator {
        &self.schema
    }

    /// 校验并解码 XML，事件变体由根元素决定
    pub fn decode_xml(&self, raw: &str) -> GatewayResult<Event> {
        self.schema.validate(raw)?;
        let root = wire::xml_v1::root_element(raw)?;
        let kind = EventKind::from_element_name(&root).ok_or_else(|| {
            GatewayError::decode(format!("root element '{root}' is not a known event"))
        })?;
        wire::xml_v1::decode(kind, raw)
    }

    /// JSON 没有根元素，变体由调用方给出
    pub fn decode_json(&self, kind: EventKind, raw: &str) -> GatewayResult<Event> {
        wire::json::decode(kind, raw)
    }

    /// 按线上格式解码，XML 的根元素必须与 `kind` 一致
    pub fn decode(&self, format: WireFormat, kind: EventKind, raw: &str) -> GatewayResult<Event> {
        let event = match format {
            WireFormat::Xml => self.decode_xml(raw)?,
            WireFormat::Json => self.decode_json(kind, raw)?,
        };
        if event.kind() != kind {
            return Err(GatewayError::decode(format!(
                "expected a {kind} event but received {}",
                event.kind()
            )));
        }
        Ok(event)
    }

    /// 解码为具体的事件变体
    pub fn decode_as<E: EventVariant>(&self, format: WireFormat, raw: &str) -> GatewayResult<E> {
        let event = self.decode(format, E::KIND, raw)?;
        E::from_event(event).map_err(|other| {
            GatewayError::decode(format!("expected a {} event but received {}", E::KIND, other.kind()))
        })
    }

    /// 二进制报文入口，非 UTF-8 内容视为解码错误
    pub fn decode_bytes<E: EventVariant>(&self, format: WireFormat, body: &[u8]) -> GatewayResult<E> {
        let raw = std::str::from_utf8(body)
            .map_err(|e| GatewayError::decode(format!("payload is not valid UTF-8: {e}")))?;
        self.decode_as(format, raw)
    }

    pub fn encode_xml(&self, event: &Event) -> GatewayResult<String> {
        wire::xml_v1::encode(event)
    }

    pub fn encode_json(&self, event: &Event) -> GatewayResult<String> {
        wire::json::encode(event)
    }

    pub fn encode(&self, format: WireFormat, event: &Event) -> GatewayResult<String> {
        match format {
            WireFormat::Xml => self.encode_xml(event),
            WireFormat::Json => self.encode_json(event),
        }
    }
}
