//! Session-local state types

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{tag, AppType, MessageType};
use crate::session::Session;

/// What the connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Nothing dispatched yet
    Unclassified,
    Camera,
    Nvr,
    /// Issued a client message without registering as a device
    Client,
}

impl SessionKind {
    pub fn is_device(self) -> bool {
        matches!(self, SessionKind::Camera | SessionKind::Nvr)
    }
}

/// One channel of an NVR (or the implicit channel 0 of a camera).
#[derive(Debug, Clone, Default)]
pub struct ChannelInfo {
    pub channel: String,
    pub name: String,
    pub status: String,
    pub snap_url: String,
}

/// Device attributes announced at registration and updated by heartbeats.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub serial: String,
    pub name: String,
    pub tag: String,
    pub app_type: Option<AppType>,
    pub terminal_type: String,
    pub channel_count: u32,
    pub channels: HashMap<String, ChannelInfo>,
    /// Latest snapshot URL for single-camera devices
    pub snap_url: String,
}

fn field_str(value: &Value, name: &str) -> String {
    match value.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl DeviceInfo {
    /// Parse a register body. The app type must be a known device type and
    /// the serial non-empty.
    pub fn from_body(body: &Value) -> Result<DeviceInfo> {
        let app_type = AppType::from_str(&field_str(body, tag::APP_TYPE))
            .ok_or_else(|| Error::BadRequest("unsupported AppType".into()))?;

        let serial = field_str(body, tag::SERIAL);
        if serial.is_empty() {
            return Err(Error::BadRequest("Serial attribute absent".into()));
        }

        let mut channels = HashMap::new();
        if let Some(Value::Array(items)) = body.get(tag::CHANNELS) {
            for item in items {
                let channel = field_str(item, tag::CHANNEL);
                if channel.is_empty() {
                    continue;
                }
                channels.insert(
                    channel.clone(),
                    ChannelInfo {
                        channel,
                        name: field_str(item, tag::NAME),
                        status: field_str(item, tag::STATUS),
                        snap_url: field_str(item, tag::SNAP_URL),
                    },
                );
            }
        }

        let channel_count = match body.get(tag::CHANNEL_COUNT) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => channels.len() as u32,
        };

        Ok(DeviceInfo {
            serial,
            name: field_str(body, tag::NAME),
            tag: field_str(body, tag::TAG),
            app_type: Some(app_type),
            terminal_type: field_str(body, tag::TERMINAL_TYPE),
            channel_count,
            channels,
            snap_url: String::new(),
        })
    }

    /// Replace this info with a re-announced one, keeping snapshot URLs the
    /// announcement does not carry. Register doubles as heartbeat.
    pub fn apply_update(&mut self, mut new: DeviceInfo) {
        new.snap_url = std::mem::take(&mut self.snap_url);
        for (id, channel) in &mut new.channels {
            if channel.snap_url.is_empty() {
                if let Some(prev) = self.channels.get(id) {
                    channel.snap_url = prev.snap_url.clone();
                }
            }
        }
        *self = new;
    }

    /// Record the latest snapshot URL: device-level for cameras, per-channel
    /// for NVRs.
    pub fn hold_snap_url(&mut self, url: &str, channel: &str) {
        match self.app_type {
            Some(AppType::Camera) => self.snap_url = url.to_string(),
            _ => {
                self.channels
                    .entry(channel.to_string())
                    .or_insert_with(|| ChannelInfo {
                        channel: channel.to_string(),
                        ..ChannelInfo::default()
                    })
                    .snap_url = url.to_string();
            }
        }
    }

    pub fn app_type_str(&self) -> &'static str {
        self.app_type.map(AppType::as_str).unwrap_or("")
    }
}

/// Scratch area a waiting client reads on each poll tick. The device-ack
/// handler fills it in from the other side.
#[derive(Debug, Clone, Default)]
pub struct WaitSlot {
    pub waiting: bool,
    /// 0 until the device replies, then the device's error number
    pub response_code: i32,
    /// Client CSeq recorded in the consumed pending entry; only a match
    /// satisfies the wait
    pub matched_cseq: u32,
    pub timeout_ticks: u32,
    pub relay_ip: String,
    pub relay_port: String,
    pub stream_id: String,
    pub protocol: String,
}

/// Entry in a device session's pending map, keyed by the device CSeq the
/// device will echo. Owns a reference to the waiting client; inserting one
/// adds a holder on the client, removing one must release it.
pub struct PendingEntry {
    pub kind: MessageType,
    pub client: Arc<Session>,
    pub client_cseq: u32,
}
