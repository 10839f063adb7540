//! Protocol message handlers
//!
//! ## Responsibilities
//!
//! - Total dispatch over the envelope's message kind
//! - The nine protocol operations: register, get-stream, push-ack,
//!   free-stream, stop-ack, device-list, device-info, post-snap, and the
//!   501 fallback
//! - Uniform error envelopes echoing the request CSeq with the response
//!   kind paired to the request kind
//!
//! Handlers never yield mid-logic. A handler that cannot finish inline
//! (get-stream waiting on a device) parks a wait quantum in the exchange and
//! is re-entered with the same body on the next tick, so it must be
//! idempotent with respect to `wait_slot.waiting`.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::device_registry::RegisterOutcome;
use crate::error::{Error, Result};
use crate::protocol::{codes, playback_url, tag, AppType, Envelope, MessageBuilder, MessageType};
use crate::session::types::{DeviceInfo, PendingEntry, SessionKind, WaitSlot};
use crate::session::{Exchange, Session};
use crate::snapshot_store::SnapshotStore;

const WAIT_QUANTUM: Duration = Duration::from_millis(100);

/// Route a complete JSON body to its handler and convert handler errors to
/// the uniform error envelope.
pub(crate) async fn process_request(session: &Arc<Session>, ex: &mut Exchange) {
    if ex.body.is_empty() {
        return;
    }

    let envelope = match Envelope::parse(&ex.body) {
        Ok(env) => env,
        Err(err) => {
            tracing::debug!(session_id = %session.id(), error = %err, "Unparseable message body");
            session.queue_status(ex, 501);
            return;
        }
    };
    let kind = match envelope.msg_type() {
        Some(kind) => kind,
        None => {
            tracing::debug!(
                session_id = %session.id(),
                message_type = envelope.header.message_type,
                "Unknown message type"
            );
            session.queue_status(ex, 501);
            return;
        }
    };

    if matches!(
        kind,
        MessageType::CsGetStreamReq
            | MessageType::CsFreeStreamReq
            | MessageType::CsDeviceListReq
            | MessageType::CsDeviceInfoReq
    ) {
        session.classify_client();
    }

    let result = match kind {
        MessageType::DsRegisterReq => handle_register(session, &envelope, ex).await,
        MessageType::CsGetStreamReq => handle_get_stream(session, &envelope, ex).await,
        MessageType::DsPushStreamAck => handle_push_stream_ack(session, &envelope).await,
        MessageType::CsFreeStreamReq => handle_free_stream(session, &envelope, ex).await,
        MessageType::DsStreamStopAck => handle_stream_stop_ack(session),
        MessageType::CsDeviceListReq => handle_device_list(session, &envelope, ex).await,
        MessageType::CsDeviceInfoReq => handle_device_info(session, &envelope, ex).await,
        MessageType::DsPostSnapReq => handle_post_snap(session, &envelope, ex).await,
        _ => {
            session.queue_status(ex, 501);
            return;
        }
    };

    if let Err(err) = result {
        let code = err.error_num();
        tracing::debug!(
            session_id = %session.id(),
            kind = ?kind,
            code,
            error = %err,
            "Request failed"
        );
        let msg = MessageBuilder::new(kind.response_kind())
            .cseq(&envelope.header.cseq)
            .result(code)
            .build();
        session.queue_json(ex, &msg, false);
    }
}

/// Device register; doubles as heartbeat for an already-registered device.
async fn handle_register(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    let info = DeviceInfo::from_body(&env.body)?;
    let serial = info.serial.clone();
    let app_type = info
        .app_type
        .ok_or_else(|| Error::BadRequest("unsupported AppType".into()))?;

    session.device.lock().await.apply_update(info);

    if !session.authenticated() {
        session.set_kind(match app_type {
            AppType::Camera => SessionKind::Camera,
            AppType::Nvr => SessionKind::Nvr,
        });

        match session
            .ctx
            .registry
            .register(&serial, Arc::clone(session))
            .await
        {
            RegisterOutcome::Ok => {
                session.ctx.relays.register_device_name(&serial);
                session.set_authenticated(true);
                tracing::info!(serial = %serial, session_id = %session.id(), "Device registered");
            }
            RegisterOutcome::Conflict => {
                // Evict the current holder; it removes itself on teardown
                // and the device retries until the serial is free.
                if let Some(current) = session.ctx.registry.resolve(&serial).await {
                    current.session().kill();
                    tracing::warn!(
                        serial = %serial,
                        evicted = %current.session().id(),
                        "Serial conflict, killing current holder"
                    );
                }
                return Err(Error::Conflict(serial));
            }
        }
    }

    let msg = MessageBuilder::new(MessageType::SdRegisterAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::SERIAL, serial.as_str())
        .field(tag::SESSION_ID, session.id())
        .build();
    session.queue_json(ex, &msg, false);
    Ok(())
}

/// Client get-stream: answer inline when a relay is already associated,
/// otherwise broker a push to the device and poll-wait for its ack.
async fn handle_get_stream(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    let client_cseq = env.cseq_u32();
    let serial = env.body_str(tag::SERIAL);
    let mut channel = env.body_str(tag::CHANNEL);
    if channel.is_empty() {
        channel = "0".to_string();
    }
    let mut protocol = env.body_str(tag::PROTOCOL);
    let mut stream_kind = env.body_str(tag::RESERVE);
    if stream_kind.is_empty() {
        stream_kind = "1".to_string();
    }
    if serial.is_empty() || protocol.is_empty() {
        return Err(Error::BadRequest("Serial and Protocol are required".into()));
    }

    let config = &session.ctx.config;
    let url: String;

    let waiting = session.wait.lock().await.waiting;
    if !waiting {
        let device = session
            .ctx
            .registry
            .resolve(&serial)
            .await
            .ok_or_else(|| Error::DeviceNotFound(serial.clone()))?;

        if let Some(relay) = session.ctx.relays.associated_relay(&serial, &channel) {
            // the relay fleet already has this stream; answer inline
            let token = session
                .ctx
                .relays
                .mint_stream_id(config.stream_id_timeout_ms)
                .ok_or_else(|| Error::Internal("stream id mint failed".into()))?;
            url = playback_url(&relay.ip, &relay.port, &serial, &channel, &token);
        } else {
            let relay = session.ctx.relays.best_relay().ok_or(Error::ServiceNotFound)?;
            let token = session
                .ctx
                .relays
                .mint_stream_id(config.stream_id_timeout_ms)
                .ok_or_else(|| Error::Internal("stream id mint failed".into()))?;

            let dev = device.session();
            let dev_cseq = dev.next_cseq();
            let push = MessageBuilder::new(MessageType::SdPushStreamReq)
                .cseq_num(dev_cseq)
                .field(tag::STREAM_ID, token.as_str())
                .field(tag::SERVER_IP, relay.ip.as_str())
                .field(tag::SERVER_PORT, relay.port.as_str())
                .field(tag::SERIAL, serial.as_str())
                .field(tag::CHANNEL, channel.as_str())
                .field(tag::PROTOCOL, protocol.as_str())
                .field(tag::RESERVE, stream_kind.as_str())
                .build();

            // arm the wait slot before the push can possibly be answered
            *session.wait.lock().await = WaitSlot {
                waiting: true,
                ..WaitSlot::default()
            };
            dev.insert_pending(
                dev_cseq,
                PendingEntry {
                    kind: MessageType::CsGetStreamReq,
                    client: Arc::clone(session),
                    client_cseq,
                },
            )
            .await;
            dev.send_message(&push);
            tracing::debug!(
                serial = %serial,
                dev_cseq,
                client_cseq,
                relay_ip = %relay.ip,
                "Brokered push-stream request"
            );

            ex.wait_quantum = Some(WAIT_QUANTUM);
            return Ok(());
        }
    } else {
        let mut wait = session.wait.lock().await;
        if wait.response_code == 0 {
            // device still silent
            wait.timeout_ticks += 1;
            if u64::from(wait.timeout_ticks) > config.start_stream_timeout_ms / 100 {
                wait.waiting = false;
                return Err(Error::Timeout);
            }
            ex.wait_quantum = Some(WAIT_QUANTUM);
            return Ok(());
        } else if wait.matched_cseq != client_cseq {
            // stale reply from an earlier aborted attempt; keep waiting
            wait.response_code = 0;
            wait.timeout_ticks += 1;
            ex.wait_quantum = Some(WAIT_QUANTUM);
            return Ok(());
        } else if wait.response_code == codes::SUCCESS_OK {
            wait.waiting = false;
            stream_kind = wait.stream_id.clone();
            if !wait.protocol.is_empty() {
                protocol = wait.protocol.clone();
            }
            let token = session
                .ctx
                .relays
                .mint_stream_id(config.stream_id_timeout_ms)
                .ok_or_else(|| Error::Internal("stream id mint failed".into()))?;
            url = playback_url(&wait.relay_ip, &wait.relay_port, &serial, &channel, &token);
        } else {
            wait.waiting = false;
            return Err(Error::Device(wait.response_code));
        }
    }

    let msg = MessageBuilder::new(MessageType::ScGetStreamAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::URL, url.as_str())
        .field(tag::SERIAL, serial.as_str())
        .field(tag::CHANNEL, channel.as_str())
        .field(tag::PROTOCOL, protocol.as_str())
        .field(tag::RESERVE, stream_kind.as_str())
        .build();
    session.queue_json(ex, &msg, false);
    Ok(())
}

/// Device push-stream ack: correlate by the echoed CSeq and wake the waiting
/// client through its wait slot. No response goes back to the device.
async fn handle_push_stream_ack(session: &Arc<Session>, env: &Envelope) -> Result<()> {
    if !session.authenticated() {
        return Err(Error::Unauthorized);
    }

    let cseq = env.cseq_u32();
    let mut code = env.header.error_num as i32;
    if code == 0 {
        // device firmwares report 0 for success
        code = codes::SUCCESS_OK;
    }
    let relay_ip = env.body_str(tag::SERVER_IP);
    let relay_port = env.body_str(tag::SERVER_PORT);
    let mut stream_kind = env.body_str(tag::RESERVE);
    if stream_kind.is_empty() {
        stream_kind = "1".to_string();
    }
    let protocol = env.body_str(tag::PROTOCOL);

    let entry = match session.take_pending(cseq).await {
        Some(entry) => entry,
        None => {
            // the device echoed a CSeq we never issued
            tracing::debug!(session_id = %session.id(), cseq, "Push ack for unknown CSeq, ignoring");
            return Ok(());
        }
    };

    if entry.kind == MessageType::CsGetStreamReq {
        let mut wait = entry.client.wait.lock().await;
        if code == codes::SUCCESS_OK {
            wait.relay_ip = relay_ip;
            wait.relay_port = relay_port;
            wait.stream_id = stream_kind;
            wait.protocol = protocol;
        }
        wait.matched_cseq = entry.client_cseq;
        wait.response_code = code;
    }
    // entry removal always releases the client hold
    entry.client.release_holder();
    Ok(())
}

/// Client free-stream: forward a stop to the device (fire and forget) and
/// ack the client immediately.
async fn handle_free_stream(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    let compound = env.body_str(tag::SERIAL);
    if compound.is_empty() {
        return Err(Error::BadRequest("Serial is required".into()));
    }
    // "serial/channel" compound form, or separate fields
    let (serial, mut channel) = match compound.split_once('/') {
        Some((serial, channel)) => (serial.to_string(), channel.to_string()),
        None => (compound, env.body_str(tag::CHANNEL)),
    };
    if channel.is_empty() {
        channel = "0".to_string();
    }
    let mut stream_kind = env.body_str(tag::RESERVE);
    if stream_kind.is_empty() {
        stream_kind = "1".to_string();
    }
    let protocol = env.body_str(tag::PROTOCOL);
    if serial.is_empty() || protocol.is_empty() {
        return Err(Error::BadRequest("Serial and Protocol are required".into()));
    }

    let device = session
        .ctx
        .registry
        .resolve(&serial)
        .await
        .ok_or_else(|| Error::DeviceNotFound(serial.clone()))?;

    let dev = device.session();
    let stop = MessageBuilder::new(MessageType::SdStreamStopReq)
        .cseq_num(dev.next_cseq())
        .field(tag::SERIAL, serial.as_str())
        .field(tag::CHANNEL, channel.as_str())
        .field(tag::RESERVE, stream_kind.as_str())
        .field(tag::PROTOCOL, protocol.as_str())
        .build();
    dev.send_message(&stop);

    let msg = MessageBuilder::new(MessageType::ScFreeStreamAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::SERIAL, serial.as_str())
        .field(tag::CHANNEL, channel.as_str())
        .field(tag::RESERVE, stream_kind.as_str())
        .field(tag::PROTOCOL, protocol.as_str())
        .build();
    session.queue_json(ex, &msg, false);
    Ok(())
}

/// Device stop ack: nothing to correlate, nothing to answer.
fn handle_stream_stop_ack(session: &Arc<Session>) -> Result<()> {
    if !session.authenticated() {
        return Err(Error::Unauthorized);
    }
    Ok(())
}

/// Client device list (JSON form; unfiltered).
async fn handle_device_list(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    let sessions = session.ctx.registry.snapshot().await;
    let mut devices = Vec::with_capacity(sessions.len());
    for dev in &sessions {
        let info = dev.device_info().await;
        devices.push(device_entry(&info));
    }

    let msg = MessageBuilder::new(MessageType::ScDeviceListAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::DEVICE_COUNT, devices.len() as u64)
        .array(tag::DEVICES, devices)
        .build();
    session.queue_json(ex, &msg, false);
    Ok(())
}

/// Client channel list for one device.
async fn handle_device_info(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    let serial = env.body_str(tag::SERIAL);
    if serial.is_empty() {
        return Err(Error::BadRequest("Serial is required".into()));
    }

    let device = session
        .ctx
        .registry
        .resolve(&serial)
        .await
        .ok_or_else(|| Error::DeviceNotFound(serial.clone()))?;
    let info = device.session().device_info().await;

    let mut builder = MessageBuilder::new(MessageType::ScDeviceInfoAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::SERIAL, serial.as_str());
    if info.app_type == Some(AppType::Camera) {
        builder = builder.field(tag::SNAP_URL, info.snap_url.as_str());
    } else {
        builder = builder
            .field(tag::CHANNEL_COUNT, info.channel_count)
            .array(tag::CHANNELS, channel_entries(&info));
    }

    session.queue_json(ex, &builder.build(), false);
    Ok(())
}

/// Device snapshot upload.
async fn handle_post_snap(session: &Arc<Session>, env: &Envelope, ex: &mut Exchange) -> Result<()> {
    if !session.authenticated() {
        return Err(Error::Unauthorized);
    }

    let image = env.body_str(tag::IMAGE);
    let serial = env.body_str(tag::SERIAL);
    let ext = env.body_str(tag::TYPE);
    let mut channel = env.body_str(tag::CHANNEL);
    if channel.is_empty() {
        channel = "0".to_string();
    }
    let time = SnapshotStore::normalize_time(&env.body_str(tag::TIME));

    if image.is_empty() || serial.is_empty() || ext.is_empty() {
        return Err(Error::BadRequest("Image, Serial and Type are required".into()));
    }

    let data = BASE64
        .decode(image.as_bytes())
        .map_err(|_| Error::BadRequest("Image is not valid Base64".into()))?;

    let url = session
        .ctx
        .snapshots
        .save(&serial, &channel, &time, &ext, &data)
        .await
        .map_err(|err| Error::Internal(format!("snapshot write failed: {err}")))?;

    session.device.lock().await.hold_snap_url(&url, &channel);

    let msg = MessageBuilder::new(MessageType::SdPostSnapAck)
        .cseq(&env.header.cseq)
        .result(codes::SUCCESS_OK)
        .field(tag::SERIAL, serial.as_str())
        .field(tag::CHANNEL, channel.as_str())
        .build();
    session.queue_json(ex, &msg, false);
    Ok(())
}

/// One entry of a device listing; cameras carry their snapshot URL.
pub(super) fn device_entry(info: &DeviceInfo) -> Value {
    let mut entry = Map::new();
    entry.insert(tag::SERIAL.to_string(), json!(info.serial));
    entry.insert(tag::NAME.to_string(), json!(info.name));
    entry.insert(tag::TAG.to_string(), json!(info.tag));
    entry.insert(tag::APP_TYPE.to_string(), json!(info.app_type_str()));
    entry.insert(tag::TERMINAL_TYPE.to_string(), json!(info.terminal_type));
    if info.app_type == Some(AppType::Camera) {
        entry.insert(tag::SNAP_URL.to_string(), json!(info.snap_url));
    }
    Value::Object(entry)
}

pub(super) fn channel_entries(info: &DeviceInfo) -> Vec<Value> {
    info.channels
        .values()
        .map(|channel| {
            let mut entry = Map::new();
            entry.insert(tag::CHANNEL.to_string(), json!(channel.channel));
            entry.insert(tag::NAME.to_string(), json!(channel.name));
            entry.insert(tag::STATUS.to_string(), json!(channel.status));
            entry.insert(tag::SNAP_URL.to_string(), json!(channel.snap_url));
            Value::Object(entry)
        })
        .collect()
}
