//! RelayDirectory - metadata-cache hooks
//!
//! ## Responsibilities
//!
//! - Device-name registration on successful register
//! - Lookup of the relay already associated with a `(serial, channel)`
//! - Least-loaded relay selection for new streams
//! - Stream-token minting for playback URLs
//!
//! The hub only invokes these hooks; the backing store (in production a
//! shared cache next to the relay fleet) owns association lifetimes and
//! token expiry. Every hook is best-effort: a missing provider answers
//! `None` / no-op and the handlers map that to the proper protocol error.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

/// Address of a media relay ("darwin") server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    pub ip: String,
    pub port: String,
}

impl RelayAddr {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }
}

/// Hooks the session handlers invoke on the external metadata cache.
pub trait RelayDirectory: Send + Sync {
    /// Record a registered device name.
    fn register_device_name(&self, serial: &str);

    /// Relay already bound to `(serial, channel)`, if any.
    fn associated_relay(&self, serial: &str, channel: &str) -> Option<RelayAddr>;

    /// The least-loaded relay, if any relay is alive.
    fn best_relay(&self) -> Option<RelayAddr>;

    /// Mint a playback token valid for `timeout_ms` in the backing store.
    fn mint_stream_id(&self, timeout_ms: u64) -> Option<String>;
}

/// In-process directory used by the binary and the tests.
#[derive(Default)]
pub struct MemoryRelayDirectory {
    device_names: RwLock<Vec<String>>,
    associations: RwLock<HashMap<(String, String), RelayAddr>>,
    /// relay -> current load (stream count)
    relays: RwLock<Vec<(RelayAddr, u32)>>,
}

impl MemoryRelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a relay eligible for `best_relay`.
    pub fn add_relay(&self, addr: RelayAddr) {
        self.relays.write().unwrap().push((addr, 0));
    }

    pub fn set_relay_load(&self, addr: &RelayAddr, load: u32) {
        let mut relays = self.relays.write().unwrap();
        if let Some(entry) = relays.iter_mut().find(|(a, _)| a == addr) {
            entry.1 = load;
        }
    }

    /// Bind `(serial, channel)` to a relay, as the relay fleet would after a
    /// successful push.
    pub fn associate(&self, serial: &str, channel: &str, addr: RelayAddr) {
        self.associations
            .write()
            .unwrap()
            .insert((serial.to_string(), channel.to_string()), addr);
    }

    pub fn device_names(&self) -> Vec<String> {
        self.device_names.read().unwrap().clone()
    }
}

impl RelayDirectory for MemoryRelayDirectory {
    fn register_device_name(&self, serial: &str) {
        let mut names = self.device_names.write().unwrap();
        if !names.iter().any(|n| n == serial) {
            names.push(serial.to_string());
        }
    }

    fn associated_relay(&self, serial: &str, channel: &str) -> Option<RelayAddr> {
        self.associations
            .read()
            .unwrap()
            .get(&(serial.to_string(), channel.to_string()))
            .cloned()
    }

    fn best_relay(&self) -> Option<RelayAddr> {
        let relays = self.relays.read().unwrap();
        relays
            .iter()
            .min_by_key(|(_, load)| *load)
            .map(|(addr, _)| addr.clone())
    }

    fn mint_stream_id(&self, _timeout_ms: u64) -> Option<String> {
        Some(Uuid::new_v4().simple().to_string())
    }
}
