//! Mass flow controller device.
//!
//! Wraps a [`FlowTransport`] (the vendor link) behind the uniform
//! [`Device`] contract. A full exchange with the real controller takes
//! around 200 ms, so the fetch budget is set just above that; a reply
//! that misses the budget counts as a timeout, not a disconnect.
//!
//! The vendor frame also carries `control_point` and `gas` fields; those
//! never make it into [`FlowSample`], so buffered readings contain only
//! the numeric process values.

use async_trait::async_trait;
use log::{error, info, warn};
use std::time::Duration;

use crate::clock::RunClock;
use crate::device::{ConnectionFlag, ConnectionState, DataLog, Device, Reading};
use crate::error::{RigError, RigResult};
use crate::transport::FlowTransport;

/// Budget for one controller exchange (read or setpoint write).
const IO_BUDGET: Duration = Duration::from_millis(250);

pub struct FlowController {
    key: String,
    transport: Box<dyn FlowTransport>,
    clock: RunClock,
    flag: ConnectionFlag,
    data: DataLog,
}

impl FlowController {
    pub fn new(
        key: impl Into<String>,
        transport: Box<dyn FlowTransport>,
        capacity: usize,
        clock: RunClock,
    ) -> Self {
        let key = key.into();
        Self {
            data: DataLog::new(key.clone(), capacity),
            key,
            transport,
            clock,
            flag: ConnectionFlag::new(),
        }
    }
}

#[async_trait]
impl Device for FlowController {
    fn key(&self) -> &str {
        &self.key
    }

    fn connection(&self) -> ConnectionState {
        self.flag.state()
    }

    async fn connect(&mut self, address: &str) -> RigResult<()> {
        match self.transport.open(address).await {
            Ok(()) => {
                self.flag.set(true);
                info!("[{}] connect: flow controller on '{}'", self.key, address);
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

        let sample = match tokio::time::timeout(IO_BUDGET, self.transport.sample()).await {
            Err(_) => {
                warn!("[{}] fetch: no reply within {:?}", self.key, IO_BUDGET);
                return Ok(None);
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!("[{}] fetch: {}", self.key, e);
                return Ok(None);
            }
            Ok(Err(e)) => {
                error!("[{}] fetch: transport dropped: {}", self.key, e);
                self.flag.set(false);
                return Ok(None);
            }
            Ok(Ok(sample)) => sample,
        };

        let reading = Reading::new(
            self.clock.elapsed_secs(),
            self.clock.wall_time(),
            [
                ("setpoint".to_string(), sample.setpoint),
                ("mass_flow".to_string(), sample.mass_flow),
                ("volumetric_flow".to_string(), sample.volumetric_flow),
                ("pressure".to_string(), sample.pressure),
                ("temperature".to_string(), sample.temperature),
            ],
        );

        self.data.push(reading.clone());
        Ok(Some(reading))
    }

    async fn set_output(&mut self, value: f64) -> RigResult<()> {
        if !self.flag.is_connected() {
            return Err(RigError::Connection {
                device: self.key.clone(),
                reason: "not connected".to_string(),
            });
        }

        match tokio::time::timeout(IO_BUDGET, self.transport.write_setpoint(value)).await {
            Err(_) => Err(RigError::Timeout(self.key.clone())),
            Ok(Err(e)) => {
                error!("[{}] set_output: {}", self.key, e);
                Err(e)
            }
            Ok(Ok(())) => Ok(()),
        }
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
