//! RS-232 pressure transducer device.
//!
//! Single-value instrument: each fetch queries one pressure reading in
//! psig over a [`PressureTransport`].

use async_trait::async_trait;
use log::{error, info, warn};
use std::time::Duration;

use crate::clock::RunClock;
use crate::device::{ConnectionFlag, ConnectionState, DataLog, Device, Reading};
use crate::error::{RigError, RigResult};
use crate::transport::PressureTransport;

/// Budget for one query/reply exchange.
const IO_BUDGET: Duration = Duration::from_millis(250);

pub struct PressureSensor {
    key: String,
    transport: Box<dyn PressureTransport>,
    clock: RunClock,
    flag: ConnectionFlag,
    data: DataLog,
}

impl PressureSensor {
    pub fn new(
        key: impl Into<String>,
        transport: Box<dyn PressureTransport>,
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
impl Device for PressureSensor {
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
                info!("[{}] connect: transducer on '{}'", self.key, address);
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

        let psig = match tokio::time::timeout(IO_BUDGET, self.transport.query()).await {
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
            Ok(Ok(psig)) => psig,
        };

        let reading = Reading::new(
            self.clock.elapsed_secs(),
            self.clock.wall_time(),
            [("pressure".to_string(), psig)],
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

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPressure(f64);

    #[async_trait]
    impl PressureTransport for FixedPressure {
        async fn open(&mut self, _address: &str) -> RigResult<()> {
            Ok(())
        }
        async fn query(&mut self) -> RigResult<f64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_fetch_reads_one_pressure_value() {
        let mut dev = PressureSensor::new("PS1", Box::new(FixedPressure(14.2)), 16, RunClock::new());
        dev.connect("/dev/ttyUSB0").await.unwrap();

        let reading = dev.fetch().await.unwrap().unwrap();
        assert_eq!(reading.values.len(), 1);
        assert_eq!(reading.values["pressure"], 14.2);
    }

    #[tokio::test]
    async fn test_disconnected_fetch_is_noop() {
        let mut dev = PressureSensor::new("PS1", Box::new(FixedPressure(14.2)), 16, RunClock::new());
        assert!(dev.fetch().await.unwrap().is_none());
        assert!(dev.data().drain().is_empty());
    }
}
