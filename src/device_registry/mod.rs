//! DeviceRegistry - process-wide serial -> session map
//!
//! ## Responsibilities
//!
//! - Register an authenticated device session under its serial
//! - Conflict detection (the caller decides eviction; the registry never
//!   replaces an entry)
//! - Scoped resolution: `resolve` pins the target session with a lookup-hold
//!   that is released when the returned guard drops, on every control path
//! - Snapshot iteration for device listings
//! - Victim self-removal on teardown (`remove_if`)
//!
//! The lookup-hold is distinct from the session holder count: the hold says
//! "someone is dereferencing you right now", the holder count says "someone
//! will dereference you later and you must stay alive meanwhile".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::session::Session;

/// Outcome of a register attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    /// Another live session already owns the serial.
    Conflict,
}

/// Scoped handle returned by `resolve`; releases the lookup-hold on drop.
pub struct DeviceRef {
    session: Arc<Session>,
}

impl DeviceRef {
    fn new(session: Arc<Session>) -> Self {
        session.acquire_lookup();
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.session.release_lookup();
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<Session>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` under `serial` unless the serial is taken.
    pub async fn register(&self, serial: &str, session: Arc<Session>) -> RegisterOutcome {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(serial) {
            return RegisterOutcome::Conflict;
        }
        devices.insert(serial.to_string(), session);
        RegisterOutcome::Ok
    }

    /// Look up a device session, pinning it against destruction while the
    /// returned guard lives.
    pub async fn resolve(&self, serial: &str) -> Option<DeviceRef> {
        let devices = self.devices.lock().await;
        devices.get(serial).map(|s| DeviceRef::new(Arc::clone(s)))
    }

    /// Remove `serial` only if it is still mapped to `session_id`.
    ///
    /// An evicted session may tear down after its serial was re-registered
    /// by the winner; the identity check keeps the victim from removing the
    /// winner's entry.
    pub async fn remove_if(&self, serial: &str, session_id: &str) -> bool {
        let mut devices = self.devices.lock().await;
        if devices.get(serial).map(|s| s.id()) == Some(session_id) {
            devices.remove(serial);
            true
        } else {
            false
        }
    }

    /// Clone out the current sessions for iteration.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let devices = self.devices.lock().await;
        devices.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }
}
