//! Application state
//!
//! Holds the configuration and the process-wide components shared by every
//! session.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::device_registry::DeviceRegistry;
use crate::relay_directory::RelayDirectory;
use crate::snapshot_store::SnapshotStore;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Maximum concurrent sessions; further connections are refused
    pub max_connections: usize,
    /// Idle timeout after which a silent session is torn down
    pub session_timeout: Duration,
    /// How long a client get-stream waits for the device before 408
    pub start_stream_timeout_ms: u64,
    /// Validity window handed to the stream-ID mint hook
    pub stream_id_timeout_ms: u64,
    /// Local directory snapshots are written under
    pub snap_local_path: PathBuf,
    /// URL prefix snapshots are served back under
    pub snap_web_path: String,
    /// Request-head cap; larger heads get a 400
    pub max_request_head_bytes: usize,
    /// `Server:` header stamped on every response
    pub server_header: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(10000),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            session_timeout: Duration::from_secs(
                std::env::var("SESSION_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(90),
            ),
            start_stream_timeout_ms: std::env::var("START_STREAM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            stream_id_timeout_ms: std::env::var("STREAM_ID_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60_000),
            snap_local_path: std::env::var("SNAP_LOCAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/camhub/snap")),
            snap_web_path: std::env::var("SNAP_WEB_PATH")
                .unwrap_or_else(|_| "http://localhost:10080/snap".to_string()),
            max_request_head_bytes: std::env::var("MAX_REQUEST_HEAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2048),
            server_header: format!("CamHub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Application state shared across sessions
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: Arc<AppConfig>,
    /// Device registry (serial -> session)
    pub registry: Arc<DeviceRegistry>,
    /// Metadata-cache hooks (relay lookup, stream-ID mint)
    pub relays: Arc<dyn RelayDirectory>,
    /// Snapshot persistence
    pub snapshots: Arc<SnapshotStore>,
    /// Live session gauge
    pub session_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: AppConfig, relays: Arc<dyn RelayDirectory>) -> Self {
        let snapshots = Arc::new(SnapshotStore::new(
            config.snap_local_path.clone(),
            config.snap_web_path.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry: Arc::new(DeviceRegistry::new()),
            relays,
            snapshots,
            session_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}
