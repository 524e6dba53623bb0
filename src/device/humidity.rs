//! Humidity/temperature probe on the shared sensor bus.
//!
//! All probes talk through one [`SensorBus`] (one board serves the whole
//! bus, as on the rig), addressed by a small integer. Connecting attaches
//! the address with the board firmware and performs one verification
//! exchange; the all-0xFF sentinel during that exchange means nothing is
//! wired at the address and the connection fails.

use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;

use crate::clock::RunClock;
use crate::codec;
use crate::device::{ConnectionFlag, ConnectionState, DataLog, Device, Reading};
use crate::error::{RigError, RigResult};
use crate::transport::SensorBus;

pub struct HumidityProbe {
    key: String,
    bus: Arc<dyn SensorBus>,
    addr: Option<u8>,
    clock: RunClock,
    flag: ConnectionFlag,
    data: DataLog,
}

impl HumidityProbe {
    pub fn new(
        key: impl Into<String>,
        bus: Arc<dyn SensorBus>,
        capacity: usize,
        clock: RunClock,
    ) -> Self {
        let key = key.into();
        Self {
            data: DataLog::new(key.clone(), capacity),
            key,
            bus,
            addr: None,
            clock,
            flag: ConnectionFlag::new(),
        }
    }

    /// Parses a bus address like "0x54" or "84".
    fn parse_addr(&self, address: &str) -> RigResult<u8> {
        let parsed = if let Some(hex) = address
            .strip_prefix("0x")
            .or_else(|| address.strip_prefix("0X"))
        {
            u8::from_str_radix(hex, 16)
        } else {
            address.parse::<u8>()
        };

        parsed.map_err(|_| RigError::Connection {
            device: self.key.clone(),
            reason: format!("'{address}' is not a bus address"),
        })
    }
}

#[async_trait]
impl Device for HumidityProbe {
    fn key(&self) -> &str {
        &self.key
    }

    fn connection(&self) -> ConnectionState {
        self.flag.state()
    }

    async fn connect(&mut self, address: &str) -> RigResult<()> {
        let addr = self.parse_addr(address)?;
        self.addr = Some(addr);

        self.bus.attach(addr).await.map_err(|e| {
            self.flag.set(false);
            error!("[{}] connect: attach failed: {}", self.key, e);
            RigError::Connection {
                device: self.key.clone(),
                reason: e.to_string(),
            }
        })?;

        // One verification exchange; DeviceAbsent or a timeout here means
        // the probe is not reachable and the connection fails.
        let septets = self.bus.exchange(addr).await.map_err(|e| {
            self.flag.set(false);
            error!("[{}] connect: {}", self.key, e);
            RigError::Connection {
                device: self.key.clone(),
                reason: e.to_string(),
            }
        })?;

        match codec::decode_reply(&septets) {
            Ok(_) => {
                self.flag.set(true);
                info!("[{}] connect: probe at {:#04x}", self.key, addr);
                Ok(())
            }
            Err(e) => {
                self.flag.set(false);
                error!("[{}] connect: {}", self.key, e);
                Err(RigError::Connection {
                    device: self.key.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn fetch(&mut self) -> RigResult<Option<Reading>> {
        if !self.flag.is_connected() {
            return Ok(None);
        }
        let Some(addr) = self.addr else {
            return Ok(None);
        };

        // The bus bounds its own retry budget; a timeout keeps the probe
        // connected and simply yields no data this tick.
        let septets = match self.bus.exchange(addr).await {
            Ok(septets) => septets,
            Err(e) if e.is_transient() => {
                warn!("[{}] fetch: {}", self.key, e);
                return Ok(None);
            }
            Err(e) => {
                error!("[{}] fetch: bus dropped: {}", self.key, e);
                self.flag.set(false);
                return Ok(None);
            }
        };

        let sample = match codec::decode_reply(&septets) {
            Ok(sample) => sample,
            Err(RigError::DeviceAbsent) => {
                error!("[{}] fetch: sensor absent, marking disconnected", self.key);
                self.flag.set(false);
                return Ok(None);
            }
            Err(e) => {
                // A framing glitch on one reply; the next poll retries.
                warn!("[{}] fetch: {}", self.key, e);
                return Ok(None);
            }
        };

        let reading = Reading::new(
            self.clock.elapsed_secs(),
            self.clock.wall_time(),
            [
                ("humidity".to_string(), sample.humidity),
                ("temperature".to_string(), sample.temperature),
            ],
        );

        self.data.push(reading.clone());
        Ok(Some(reading))
    }

    fn status_flag(&self) -> ConnectionFlag {
        self.flag.clone()
    }

    fn data(&self) -> &DataLog {
        &self.data
    }

    fn data_mut(&mut self) -> &mut DataLog {
        &mut self.data
    }
}
