//! RESTful endpoints served by the session loop
//!
//! `/api/getdevicelist` and `/api/getdeviceinfo` answer inline (with
//! `Connection: close`, transient HTTP clients). `/api/getdevicestream`
//! synthesizes a get-stream JSON body and lets the normal dispatcher run it
//! on the state machine's next pass, so the cooperative poll-wait works the
//! same for REST clients as for JSON ones.

use crate::error::{Error, Result};
use crate::protocol::{codes, tag, AppType, MessageBuilder, MessageType};
use crate::session::handlers::{channel_entries, device_entry};
use crate::session::{Exchange, Session};

/// Decoded lookup of one query-string parameter (case-insensitive key).
fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k.eq_ignore_ascii_case(key) && !v.is_empty() {
            Some(
                urlencoding::decode(v)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| v.to_string()),
            )
        } else {
            None
        }
    })
}

/// `GET /api/getdevicelist?AppType=&TerminalType=`
pub(super) async fn device_list(session: &Session, query: &str, ex: &mut Exchange) -> Result<()> {
    let app_type_filter = query_param(query, tag::APP_TYPE);
    let terminal_filter = query_param(query, tag::TERMINAL_TYPE);

    let sessions = session.ctx.registry.snapshot().await;
    let mut devices = Vec::with_capacity(sessions.len());
    for dev in &sessions {
        let info = dev.device_info().await;
        if let Some(ref wanted) = app_type_filter {
            if info.app_type_str() != wanted.as_str() {
                continue;
            }
        }
        if let Some(ref wanted) = terminal_filter {
            if &info.terminal_type != wanted {
                continue;
            }
        }
        devices.push(device_entry(&info));
    }

    let msg = MessageBuilder::new(MessageType::ScDeviceListAck)
        .cseq("1")
        .result(codes::SUCCESS_OK)
        .field(tag::DEVICE_COUNT, devices.len() as u64)
        .array(tag::DEVICES, devices)
        .build();
    session.queue_json(ex, &msg, true);
    Ok(())
}

/// `GET /api/getdeviceinfo?device=<serial>`
pub(super) async fn device_info(session: &Session, query: &str, ex: &mut Exchange) -> Result<()> {
    let serial = query_param(query, tag::Q_DEVICE)
        .ok_or_else(|| Error::BadRequest("device parameter is required".into()))?;

    let msg = match session.ctx.registry.resolve(&serial).await {
        None => MessageBuilder::new(MessageType::ScDeviceInfoAck)
            .cseq("1")
            .result(codes::DEVICE_NOT_FOUND)
            .field(tag::SERIAL, serial.as_str())
            .build(),
        Some(device) => {
            let info = device.session().device_info().await;
            let mut builder = MessageBuilder::new(MessageType::ScDeviceInfoAck)
                .cseq("1")
                .result(codes::SUCCESS_OK)
                .field(tag::SERIAL, serial.as_str());
            if info.app_type == Some(AppType::Camera) {
                builder = builder.field(tag::SNAP_URL, info.snap_url.as_str());
            } else {
                builder = builder
                    .field(tag::CHANNEL_COUNT, info.channel_count)
                    .array(tag::CHANNELS, channel_entries(&info));
            }
            builder.build()
        }
    };

    session.queue_json(ex, &msg, true);
    Ok(())
}

/// `GET /api/getdevicestream?device=&channel=&protocol=&reserve=`
///
/// Produces no output here; the synthesized body re-enters the dispatcher
/// through PreprocessingRequest. The CSeq comes from the session counter so
/// the poll-wait re-dispatch stays self-consistent.
pub(super) fn device_stream(session: &Session, query: &str, ex: &mut Exchange) -> Result<()> {
    let serial = query_param(query, tag::Q_DEVICE)
        .ok_or_else(|| Error::BadRequest("device parameter is required".into()))?;
    let protocol = query_param(query, tag::Q_PROTOCOL)
        .ok_or_else(|| Error::BadRequest("protocol parameter is required".into()))?;
    let channel = query_param(query, tag::Q_CHANNEL).unwrap_or_else(|| "0".to_string());
    let reserve = query_param(query, tag::Q_RESERVE).unwrap_or_else(|| "1".to_string());

    ex.body = MessageBuilder::new(MessageType::CsGetStreamReq)
        .cseq_num(session.next_cseq())
        .field(tag::SERIAL, serial)
        .field(tag::CHANNEL, channel)
        .field(tag::PROTOCOL, protocol)
        .field(tag::RESERVE, reserve)
        .build();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_decodes_and_ignores_case() {
        let query = "AppType=EasyCamera&device=CAM%20001&empty=";
        assert_eq!(query_param(query, "apptype").as_deref(), Some("EasyCamera"));
        assert_eq!(query_param(query, "Device").as_deref(), Some("CAM 001"));
        assert_eq!(query_param(query, "empty"), None);
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param("", "device"), None);
    }
}
