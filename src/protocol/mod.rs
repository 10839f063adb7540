//! CamHub wire protocol
//!
//! ## Responsibilities
//!
//! - The JSON envelope exchanged over the HTTP-framed link:
//!   `{ "EasyDarwin": { "Header": {...}, "Body": {...} } }`
//! - Message-kind enum over the header's `MessageType` integer
//! - Error-number table and error strings
//! - Ack/request builders used by the handlers
//!
//! `CSeq` is a string-encoded integer on the wire; peers are inconsistent
//! about quoting numeric header fields, so deserialization accepts both.

mod types;

pub use types::{codes, error_string, AppType, MessageType};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Protocol version carried in every header.
pub const VERSION: &str = "1.0";

/// Envelope field names.
pub mod tag {
    pub const ROOT: &str = "EasyDarwin";
    pub const HEADER: &str = "Header";
    pub const BODY: &str = "Body";

    pub const VERSION: &str = "Version";
    pub const CSEQ: &str = "CSeq";
    pub const MESSAGE_TYPE: &str = "MessageType";
    pub const ERROR_NUM: &str = "ErrorNum";
    pub const ERROR_STRING: &str = "ErrorString";

    pub const SERIAL: &str = "Serial";
    pub const NAME: &str = "Name";
    pub const TAG: &str = "Tag";
    pub const APP_TYPE: &str = "AppType";
    pub const TERMINAL_TYPE: &str = "TerminalType";
    pub const SESSION_ID: &str = "SessionID";
    pub const CHANNEL: &str = "Channel";
    pub const CHANNEL_COUNT: &str = "ChannelCount";
    pub const CHANNELS: &str = "Channels";
    pub const DEVICES: &str = "Devices";
    pub const DEVICE_COUNT: &str = "DeviceCount";
    pub const PROTOCOL: &str = "Protocol";
    pub const RESERVE: &str = "Reserve";
    pub const STREAM_ID: &str = "StreamID";
    pub const SERVER_IP: &str = "EasyDarwinServerAddr";
    pub const SERVER_PORT: &str = "EasyDarwinServerPort";
    pub const SNAP_URL: &str = "SnapURL";
    pub const STATUS: &str = "Status";
    pub const URL: &str = "URL";
    pub const IMAGE: &str = "Image";
    pub const TYPE: &str = "Type";
    pub const TIME: &str = "Time";

    // RESTful query-string keys
    pub const Q_DEVICE: &str = "device";
    pub const Q_CHANNEL: &str = "channel";
    pub const Q_PROTOCOL: &str = "protocol";
    pub const Q_RESERVE: &str = "reserve";
}

fn de_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn de_int_lenient<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Parsed envelope header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "CSeq", default, deserialize_with = "de_string_or_number")]
    pub cseq: String,
    #[serde(rename = "MessageType", default, deserialize_with = "de_int_lenient")]
    pub message_type: i64,
    #[serde(rename = "ErrorNum", default, deserialize_with = "de_int_lenient")]
    pub error_num: i64,
    #[serde(rename = "ErrorString", default)]
    pub error_string: String,
}

/// A parsed request/reply envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: Header,
    pub body: Value,
}

impl Envelope {
    /// Parse the JSON envelope out of a request body.
    pub fn parse(raw: &str) -> Result<Envelope> {
        let root: Value = serde_json::from_str(raw)?;
        let inner = root
            .get(tag::ROOT)
            .ok_or_else(|| Error::BadRequest("missing envelope root".into()))?;
        let header = match inner.get(tag::HEADER) {
            Some(h) => serde_json::from_value(h.clone())?,
            None => Header::default(),
        };
        let body = inner.get(tag::BODY).cloned().unwrap_or(Value::Null);
        Ok(Envelope { header, body })
    }

    /// Message kind, if the wire integer is known.
    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_wire(self.header.message_type)
    }

    /// The header CSeq as an integer (0 when absent or malformed).
    pub fn cseq_u32(&self) -> u32 {
        self.header.cseq.trim().parse().unwrap_or(0)
    }

    /// A body field as a string; numbers are stringified, anything else is "".
    pub fn body_str(&self, field: &str) -> String {
        match self.body.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

/// Builder for outgoing envelopes (acks, server-originated requests).
#[derive(Debug)]
pub struct MessageBuilder {
    kind: MessageType,
    cseq: String,
    error: Option<i32>,
    body: Map<String, Value>,
    extra: Option<(String, Value)>,
}

impl MessageBuilder {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            cseq: String::new(),
            error: None,
            body: Map::new(),
            extra: None,
        }
    }

    /// Echo (or set) the header CSeq.
    pub fn cseq(mut self, cseq: &str) -> Self {
        self.cseq = cseq.to_string();
        self
    }

    pub fn cseq_num(self, cseq: u32) -> Self {
        let s = cseq.to_string();
        self.cseq(&s)
    }

    /// Set ErrorNum/ErrorString. Requests omit them, acks carry them.
    pub fn result(mut self, code: i32) -> Self {
        self.error = Some(code);
        self
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.body.insert(name.to_string(), value.into());
        self
    }

    /// Attach an array field (device or channel listings).
    pub fn array(mut self, name: &str, items: Vec<Value>) -> Self {
        self.extra = Some((name.to_string(), Value::Array(items)));
        self
    }

    /// Serialize to the wire JSON.
    pub fn build(self) -> String {
        let mut header = Map::new();
        header.insert(tag::VERSION.into(), json!(VERSION));
        header.insert(tag::CSEQ.into(), json!(self.cseq));
        header.insert(tag::MESSAGE_TYPE.into(), json!(self.kind.wire()));
        if let Some(code) = self.error {
            header.insert(tag::ERROR_NUM.into(), json!(code));
            header.insert(tag::ERROR_STRING.into(), json!(error_string(code)));
        }

        let mut body = self.body;
        if let Some((name, items)) = self.extra {
            body.insert(name, items);
        }

        let mut inner = Map::new();
        inner.insert(tag::HEADER.into(), Value::Object(header));
        inner.insert(tag::BODY.into(), Value::Object(body));
        let mut root = Map::new();
        root.insert(tag::ROOT.into(), Value::Object(inner));
        Value::Object(root).to_string()
    }
}

/// Playback URL handed to clients once a stream is brokered.
pub fn playback_url(ip: &str, port: &str, serial: &str, channel: &str, token: &str) -> String {
    format!("rtsp://{ip}:{port}/{serial}/{channel}.sdp?token={token}")
}
