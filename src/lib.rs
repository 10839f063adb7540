//! CamHub Library
//!
//! Control/management hub for a distributed surveillance-media platform.
//!
//! ## Architecture
//!
//! 1. Session - per-connection state machine and request correlation
//! 2. Protocol - JSON-in-HTTP envelope, message kinds, error codes
//! 3. Http - request framing and response writing for the session loop
//! 4. DeviceRegistry - process-wide serial -> session map with eviction
//! 5. RelayDirectory - metadata-cache hooks (relay lookup, stream-ID mint)
//! 6. SnapshotStore - device snapshot persistence
//!
//! Devices (cameras, NVRs) hold a long-lived connection to register and
//! receive push-stream commands; clients connect transiently to enumerate
//! devices and broker live streams against external media relays. The hub
//! never touches media itself.

pub mod device_registry;
pub mod error;
pub mod http;
pub mod protocol;
pub mod relay_directory;
pub mod session;
pub mod snapshot_store;
pub mod state;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
