//! Device abstraction: the uniform contract every instrument implements.
//!
//! A [`Device`] is one physical or simulated instrument. All kinds share
//! the same four operations — connect, fetch one reading, write an
//! actuator output (actuators only), and access to the composed
//! [`DataLog`] — so the scheduler can poll a heterogeneous registry
//! without knowing what is on the other end of each transport.
//!
//! Connection semantics, common to every kind:
//! - `connect` makes exactly one transport attempt and never retries.
//! - A disconnected device fetches nothing: `fetch` returns `Ok(None)`.
//! - A transport failure during `fetch` marks the device `Disconnected`
//!   and yields `Ok(None)`; nothing reconnects automatically.
//! - A timeout inside the I/O budget yields `Ok(None)` but preserves the
//!   connection state.

pub mod buffer;
pub mod flow;
pub mod humidity;
pub mod mock;
pub mod pressure;

pub use buffer::{BufferHandle, DataLog, DisplayWindow, Reading, ReadingBuffer};
pub use flow::FlowController;
pub use humidity::HumidityProbe;
pub use mock::SimulatedDevice;
pub use pressure::PressureSensor;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RigError, RigResult};

/// Connection lifecycle of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Shared connection flag, readable from outside the scheduler task.
///
/// The scheduler task is the only writer; the dashboard layer reads
/// clones of it to answer connection-status queries.
#[derive(Clone, Debug, Default)]
pub struct ConnectionFlag(Arc<AtomicBool>);

impl ConnectionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Uniform contract over all instrument kinds.
#[async_trait]
pub trait Device: Send {
    /// Stable device key, e.g. "MFC1".
    fn key(&self) -> &str;

    /// Current connection state.
    fn connection(&self) -> ConnectionState;

    /// Attempts a transport-level connection to `address`. One attempt,
    /// no retry; sets the connection state either way.
    async fn connect(&mut self, address: &str) -> RigResult<()>;

    /// Fetches one reading.
    ///
    /// Returns `Ok(None)` when there is no data: the device is
    /// disconnected, the reply timed out, or the transport dropped (in
    /// which case the device is now marked `Disconnected`). A successful
    /// reading has already been pushed into the device's [`DataLog`]
    /// when this returns.
    async fn fetch(&mut self) -> RigResult<Option<Reading>>;

    /// Writes an actuator output. Only flow controllers accept this.
    async fn set_output(&mut self, _value: f64) -> RigResult<()> {
        Err(RigError::Unsupported {
            device: self.key().to_string(),
            operation: "set_output".to_string(),
        })
    }

    /// Shared flag mirroring the connection state, for status queries
    /// from outside the scheduler task.
    fn status_flag(&self) -> ConnectionFlag;

    /// The composed ring buffer / recording sink.
    fn data(&self) -> &DataLog;
    fn data_mut(&mut self) -> &mut DataLog;
}

/// Startup-fixed mapping from device key to instrument.
///
/// Owned by the scheduler; the `take`/`restore` pair lets the scheduler
/// move devices into concurrent command futures and put them back before
/// the tick proceeds.
pub struct DeviceRegistry {
    devices: HashMap<String, Box<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    pub fn insert(&mut self, device: Box<dyn Device>) {
        self.devices.insert(device.key().to_string(), device);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.devices.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Box<dyn Device>> {
        self.devices.get_mut(key)
    }

    /// Removes a device so it can be moved into a command future.
    pub fn take(&mut self, key: &str) -> Option<Box<dyn Device>> {
        self.devices.remove(key)
    }

    /// Puts a taken device back.
    pub fn restore(&mut self, device: Box<dyn Device>) {
        self.insert(device);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Device>> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drain-only buffer handles for the consumer side, one per device.
    pub fn buffer_handles(&self) -> HashMap<String, BufferHandle> {
        self.devices
            .iter()
            .map(|(k, d)| (k.clone(), d.data().handle()))
            .collect()
    }

    /// Connection-status flags for the consumer side, one per device.
    pub fn status_flags(&self) -> HashMap<String, ConnectionFlag> {
        self.devices
            .iter()
            .map(|(k, d)| (k.clone(), d.status_flag()))
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
