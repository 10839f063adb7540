//! End-to-end session scenarios over in-memory connections.
//!
//! Each test drives complete sessions (device and client) through the real
//! state machine using `tokio::io::duplex` in place of TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::protocol::{codes, tag, Envelope, MessageBuilder, MessageType};
use crate::relay_directory::{MemoryRelayDirectory, RelayAddr};
use crate::session::{Session, SessionKind};
use crate::state::{AppConfig, AppState};

fn test_state(tune: impl FnOnce(&mut AppConfig)) -> (AppState, Arc<MemoryRelayDirectory>) {
    let mut config = AppConfig::default();
    config.snap_local_path = std::env::temp_dir()
        .join("camhub-session-tests")
        .join(uuid::Uuid::new_v4().simple().to_string());
    config.snap_web_path = "http://hub.local/snap".to_string();
    config.session_timeout = Duration::from_secs(10);
    config.start_stream_timeout_ms = 1000;
    tune(&mut config);
    let relays = Arc::new(MemoryRelayDirectory::new());
    (AppState::new(config, relays.clone()), relays)
}

/// One side of a hub connection, with a read buffer carried across
/// responses so back-to-back frames do not bleed into each other.
struct Peer {
    io: DuplexStream,
    buf: Vec<u8>,
    session: Arc<Session>,
}

fn connect(state: &AppState) -> Peer {
    let (client, server) = duplex(64 * 1024);
    let (session, rx) = Session::new(state.clone());
    let handle = Arc::clone(&session);
    tokio::spawn(session.run(server, rx));
    Peer {
        io: client,
        buf: Vec::new(),
        session: handle,
    }
}

impl Peer {
    async fn send_json(&mut self, body: &str) {
        let request = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        self.io.write_all(request.as_bytes()).await.unwrap();
    }

    async fn send_get(&mut self, target: &str) {
        let request = format!("GET {} HTTP/1.1\r\nHost: hub\r\n\r\n", target);
        self.io.write_all(request.as_bytes()).await.unwrap();
    }

    /// Read exactly one HTTP response frame.
    async fn read_response(&mut self) -> (u16, String, String) {
        let header_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), self.io.read(&mut chunk))
                .await
                .expect("timed out waiting for a response")
                .unwrap();
            assert!(n > 0, "connection closed before a full response arrived");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head_bytes: Vec<u8> = self.buf.drain(..header_end).collect();
        let head = String::from_utf8(head_bytes).unwrap();
        let status: u16 = head
            .split_whitespace()
            .nth(1)
            .expect("status line")
            .parse()
            .unwrap();
        let content_length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        while self.buf.len() < content_length {
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), self.io.read(&mut chunk))
                .await
                .expect("timed out waiting for a response body")
                .unwrap();
            assert!(n > 0, "connection closed mid-body");
            self.buf.extend_from_slice(&chunk[..n]);
        }
        let body_bytes: Vec<u8> = self.buf.drain(..content_length).collect();
        (status, head, String::from_utf8(body_bytes).unwrap())
    }

    /// Read one response and parse its JSON envelope.
    async fn read_envelope(&mut self) -> Envelope {
        let (status, _, body) = self.read_response().await;
        assert_eq!(status, 200, "envelope responses ride on 200, body: {body}");
        Envelope::parse(&body).expect("response body should be an envelope")
    }

    async fn expect_closed(&mut self) {
        loop {
            let mut chunk = [0u8; 256];
            match tokio::time::timeout(Duration::from_secs(5), self.io.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => continue,
                Err(_) => panic!("connection did not close in time"),
            }
        }
    }
}

fn register_body(serial: &str, app_type: &str, name: &str) -> String {
    MessageBuilder::new(MessageType::DsRegisterReq)
        .cseq("1")
        .field(tag::SERIAL, serial)
        .field(tag::NAME, name)
        .field(tag::TAG, "")
        .field(tag::APP_TYPE, app_type)
        .field(tag::TERMINAL_TYPE, "ARM")
        .build()
}

async fn register_device(peer: &mut Peer, serial: &str) {
    peer.send_json(&register_body(serial, "EasyCamera", "lobby"))
        .await;
    let ack = peer.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::SdRegisterAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached: {what}");
}

#[tokio::test]
async fn device_registers_and_client_lists() {
    let (state, _) = test_state(|_| {});

    let mut device = connect(&state);
    device
        .send_json(&register_body("CAM001", "EasyCamera", "lobby"))
        .await;
    let ack = device.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::SdRegisterAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);
    assert_eq!(ack.body_str(tag::SERIAL), "CAM001");
    assert!(!ack.body_str(tag::SESSION_ID).is_empty());
    assert!(device.session.authenticated());
    assert!(device.session.kind().is_device());
    assert_eq!(state.registry.len().await, 1);

    // JSON device list
    let mut client = connect(&state);
    client
        .send_json(
            &MessageBuilder::new(MessageType::CsDeviceListReq)
                .cseq("9")
                .build(),
        )
        .await;
    let list = client.read_envelope().await;
    assert_eq!(list.msg_type(), Some(MessageType::ScDeviceListAck));
    assert_eq!(list.header.cseq, "9");
    assert_eq!(
        list.body.get(tag::DEVICE_COUNT).and_then(|v| v.as_u64()),
        Some(1)
    );
    let devices = list.body.get(tag::DEVICES).and_then(|v| v.as_array()).unwrap();
    assert_eq!(devices[0][tag::SERIAL], "CAM001");
    assert_eq!(devices[0][tag::APP_TYPE], "EasyCamera");
    assert_eq!(devices[0][tag::NAME], "lobby");
    assert_eq!(client.session.kind(), SessionKind::Client);

    // RESTful device list, filtered
    let mut rest = connect(&state);
    rest.send_get("/api/getdevicelist?AppType=EasyCamera").await;
    let (status, head, body) = rest.read_response().await;
    assert_eq!(status, 200);
    assert!(head.contains("Connection: close"));
    let list = Envelope::parse(&body).unwrap();
    assert_eq!(
        list.body.get(tag::DEVICE_COUNT).and_then(|v| v.as_u64()),
        Some(1)
    );
    rest.expect_closed().await;

    let mut rest = connect(&state);
    rest.send_get("/api/getdevicelist?AppType=EasyNVR").await;
    let (_, _, body) = rest.read_response().await;
    let list = Envelope::parse(&body).unwrap();
    assert_eq!(
        list.body.get(tag::DEVICE_COUNT).and_then(|v| v.as_u64()),
        Some(0)
    );
}

#[tokio::test]
async fn register_conflict_evicts_current_holder() {
    let (state, _) = test_state(|_| {});

    let mut first = connect(&state);
    register_device(&mut first, "CAM001").await;

    // second device with the same serial: conflict, first gets killed
    let mut second = connect(&state);
    second
        .send_json(&register_body("CAM001", "EasyCamera", "lobby"))
        .await;
    let conflict = second.read_envelope().await;
    assert_eq!(conflict.msg_type(), Some(MessageType::SdRegisterAck));
    assert_eq!(conflict.header.error_num as i32, codes::CONFLICT);
    assert!(!second.session.authenticated());

    first.expect_closed().await;

    // the device retries until the victim's teardown frees the serial
    let mut registered = false;
    for _ in 0..50 {
        second
            .send_json(&register_body("CAM001", "EasyCamera", "lobby"))
            .await;
        let ack = second.read_envelope().await;
        if ack.header.error_num as i32 == codes::SUCCESS_OK {
            registered = true;
            break;
        }
        assert_eq!(ack.header.error_num as i32, codes::CONFLICT);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registered, "retry never succeeded after eviction");
    assert!(second.session.authenticated());
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn get_stream_with_associated_relay_answers_inline() {
    let (state, relays) = test_state(|_| {});
    relays.associate("CAM001", "0", RelayAddr::new("10.0.0.5", "10008"));

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let mut client = connect(&state);
    client
        .send_json(
            &MessageBuilder::new(MessageType::CsGetStreamReq)
                .cseq("5")
                .field(tag::SERIAL, "CAM001")
                .field(tag::PROTOCOL, "RTSP")
                .build(),
        )
        .await;
    let ack = client.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::ScGetStreamAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);
    assert_eq!(ack.header.cseq, "5");
    assert!(
        ack.body_str(tag::URL)
            .starts_with("rtsp://10.0.0.5:10008/CAM001/0.sdp?token="),
        "unexpected URL: {}",
        ack.body_str(tag::URL)
    );
    // no push was brokered
    assert_eq!(device.session.pending_len().await, 0);
    assert_eq!(client.session.holder_count(), 0);
}

#[tokio::test]
async fn get_stream_brokers_push_and_correlates_ack() {
    let (state, relays) = test_state(|_| {});
    relays.add_relay(RelayAddr::new("10.0.0.7", "10008"));

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let mut client = connect(&state);
    client
        .send_json(
            &MessageBuilder::new(MessageType::CsGetStreamReq)
                .cseq("2")
                .field(tag::SERIAL, "CAM001")
                .field(tag::CHANNEL, "0")
                .field(tag::PROTOCOL, "RTSP")
                .build(),
        )
        .await;

    // the device receives the brokered push request
    let (status, _, body) = device.read_response().await;
    assert_eq!(status, 200);
    let push = Envelope::parse(&body).unwrap();
    assert_eq!(push.msg_type(), Some(MessageType::SdPushStreamReq));
    assert_eq!(push.body_str(tag::SERIAL), "CAM001");
    assert_eq!(push.body_str(tag::SERVER_IP), "10.0.0.7");
    assert_eq!(push.body_str(tag::SERVER_PORT), "10008");
    assert!(!push.body_str(tag::STREAM_ID).is_empty());
    let push_cseq = push.cseq_u32();
    assert!(push_cseq > 0);

    // while the device is silent, the client is held by the pending entry
    assert_eq!(client.session.holder_count(), 1);
    assert_eq!(device.session.pending_len().await, 1);

    // device acks with the echoed CSeq; client resumes on its next tick
    device
        .send_json(
            &MessageBuilder::new(MessageType::DsPushStreamAck)
                .cseq_num(push_cseq)
                .result(codes::SUCCESS_OK)
                .field(tag::SERIAL, "CAM001")
                .field(tag::CHANNEL, "0")
                .field(tag::SERVER_IP, "10.0.0.7")
                .field(tag::SERVER_PORT, "10008")
                .field(tag::RESERVE, "1")
                .build(),
        )
        .await;

    let ack = client.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::ScGetStreamAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);
    assert_eq!(ack.header.cseq, "2");
    assert!(
        ack.body_str(tag::URL)
            .starts_with("rtsp://10.0.0.7:10008/CAM001/0.sdp?token="),
        "unexpected URL: {}",
        ack.body_str(tag::URL)
    );
    assert_eq!(ack.body_str(tag::RESERVE), "1");

    let client_session = Arc::clone(&client.session);
    eventually("client holder released", move || {
        client_session.holder_count() == 0
    })
    .await;
    assert_eq!(device.session.pending_len().await, 0);
}

#[tokio::test]
async fn get_stream_times_out_when_device_stays_silent() {
    let (state, relays) = test_state(|config| {
        config.start_stream_timeout_ms = 300;
    });
    relays.add_relay(RelayAddr::new("10.0.0.7", "10008"));

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let mut client = connect(&state);
    client
        .send_json(
            &MessageBuilder::new(MessageType::CsGetStreamReq)
                .cseq("3")
                .field(tag::SERIAL, "CAM001")
                .field(tag::PROTOCOL, "RTSP")
                .build(),
        )
        .await;

    // push goes out, but the device never answers
    let (_, _, body) = device.read_response().await;
    assert_eq!(
        Envelope::parse(&body).unwrap().msg_type(),
        Some(MessageType::SdPushStreamReq)
    );

    let timeout = client.read_envelope().await;
    assert_eq!(timeout.msg_type(), Some(MessageType::ScGetStreamAck));
    assert_eq!(timeout.header.error_num as i32, codes::REQUEST_TIMEOUT);
    assert_eq!(timeout.header.cseq, "3");

    // the hold lingers until the device session tears down
    assert_eq!(client.session.holder_count(), 1);
    let device_session = Arc::clone(&device.session);
    drop(device);

    let client_session = Arc::clone(&client.session);
    eventually("client holder released by device teardown", move || {
        client_session.holder_count() == 0
    })
    .await;
    assert_eq!(device_session.pending_len().await, 0);
    eventually_async_registry_empty(&state).await;
}

async fn eventually_async_registry_empty(state: &AppState) {
    for _ in 0..200 {
        if state.registry.len().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never emptied");
}

#[tokio::test]
async fn post_snap_persists_file_and_updates_info() {
    let (state, _) = test_state(|_| {});

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let image = [0xFFu8, 0xD8, 0xFF, 0xD9];
    device
        .send_json(
            &MessageBuilder::new(MessageType::DsPostSnapReq)
                .cseq("7")
                .field(tag::SERIAL, "CAM001")
                .field(tag::CHANNEL, "0")
                .field(tag::TYPE, "jpg")
                .field(tag::TIME, "2024-01-02 03:04:05")
                .field(tag::IMAGE, BASE64.encode(image))
                .build(),
        )
        .await;
    let ack = device.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::SdPostSnapAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);

    let path = state
        .config
        .snap_local_path
        .join("CAM001")
        .join("CAM001_0_20240102030405.jpg");
    assert_eq!(tokio::fs::read(&path).await.unwrap(), image);

    let mut rest = connect(&state);
    rest.send_get("/api/getdeviceinfo?device=CAM001").await;
    let (status, _, body) = rest.read_response().await;
    assert_eq!(status, 200);
    let info = Envelope::parse(&body).unwrap();
    assert_eq!(info.header.error_num as i32, codes::SUCCESS_OK);
    assert_eq!(
        info.body_str(tag::SNAP_URL),
        "http://hub.local/snap/CAM001/CAM001_0_20240102030405.jpg"
    );
}

#[tokio::test]
async fn free_stream_forwards_stop_and_acks_immediately() {
    let (state, _) = test_state(|_| {});

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let mut client = connect(&state);
    client
        .send_json(
            &MessageBuilder::new(MessageType::CsFreeStreamReq)
                .cseq("4")
                .field(tag::SERIAL, "CAM001/2")
                .field(tag::PROTOCOL, "RTSP")
                .build(),
        )
        .await;

    let ack = client.read_envelope().await;
    assert_eq!(ack.msg_type(), Some(MessageType::ScFreeStreamAck));
    assert_eq!(ack.header.error_num as i32, codes::SUCCESS_OK);
    assert_eq!(ack.body_str(tag::CHANNEL), "2");

    let (_, _, body) = device.read_response().await;
    let stop = Envelope::parse(&body).unwrap();
    assert_eq!(stop.msg_type(), Some(MessageType::SdStreamStopReq));
    assert_eq!(stop.body_str(tag::SERIAL), "CAM001");
    assert_eq!(stop.body_str(tag::CHANNEL), "2");
}

#[tokio::test]
async fn rest_get_stream_rides_the_normal_dispatch() {
    let (state, relays) = test_state(|_| {});
    relays.associate("CAM001", "0", RelayAddr::new("10.0.0.5", "10008"));

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;

    let mut rest = connect(&state);
    rest.send_get("/api/getdevicestream?device=CAM001&channel=0&protocol=RTSP")
        .await;
    let (status, _, body) = rest.read_response().await;
    assert_eq!(status, 200);
    let ack = Envelope::parse(&body).unwrap();
    assert_eq!(ack.msg_type(), Some(MessageType::ScGetStreamAck));
    assert!(ack
        .body_str(tag::URL)
        .starts_with("rtsp://10.0.0.5:10008/CAM001/0.sdp?token="));
}

#[tokio::test]
async fn unknown_message_type_gets_501_and_closes() {
    let (state, _) = test_state(|_| {});

    let mut client = connect(&state);
    client
        .send_json(r#"{"EasyDarwin":{"Header":{"CSeq":"1","MessageType":1911},"Body":{}}}"#)
        .await;
    let (status, _, _) = client.read_response().await;
    assert_eq!(status, 501);
    client.expect_closed().await;
}

#[tokio::test]
async fn missing_content_length_gets_400_and_closes() {
    let (state, _) = test_state(|_| {});

    let mut client = connect(&state);
    client
        .io
        .write_all(b"POST / HTTP/1.1\r\nHost: hub\r\n\r\n")
        .await
        .unwrap();
    let (status, _, _) = client.read_response().await;
    assert_eq!(status, 400);
    client.expect_closed().await;
}

#[tokio::test]
async fn unauthenticated_push_ack_is_rejected() {
    let (state, _) = test_state(|_| {});

    let mut peer = connect(&state);
    peer.send_json(
        &MessageBuilder::new(MessageType::DsPushStreamAck)
            .cseq("8")
            .result(codes::SUCCESS_OK)
            .build(),
    )
    .await;
    let rejection = peer.read_envelope().await;
    assert_eq!(rejection.header.error_num as i32, codes::CLIENT_UNAUTHORIZED);
}

#[tokio::test]
async fn idle_session_times_out() {
    let (state, _) = test_state(|config| {
        config.session_timeout = Duration::from_millis(200);
    });

    let mut peer = connect(&state);
    peer.expect_closed().await;
    assert_eq!(peer.session.holder_count(), 0);
}

#[tokio::test]
async fn device_disconnect_removes_it_from_the_registry() {
    let (state, _) = test_state(|_| {});

    let mut device = connect(&state);
    register_device(&mut device, "CAM001").await;
    assert_eq!(state.registry.len().await, 1);

    drop(device);
    eventually_async_registry_empty(&state).await;
}
