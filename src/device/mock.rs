//! A simulated device that generates synthetic sine/cosine data.
//!
//! Used on the bench when no hardware is plugged in, and by the
//! integration tests. Connecting always succeeds.

use async_trait::async_trait;
use log::info;
use rand::Rng;
use std::time::Duration;

use crate::clock::RunClock;
use crate::device::{ConnectionFlag, ConnectionState, DataLog, Device, Reading};
use crate::error::RigResult;

pub struct SimulatedDevice {
    key: String,
    frequency: f64,
    latency: Duration,
    clock: RunClock,
    flag: ConnectionFlag,
    data: DataLog,
}

impl SimulatedDevice {
    pub fn new(key: impl Into<String>, frequency: f64, capacity: usize, clock: RunClock) -> Self {
        let key = key.into();
        Self {
            data: DataLog::new(key.clone(), capacity),
            key,
            frequency,
            latency: Duration::from_millis(10),
            clock,
            flag: ConnectionFlag::new(),
        }
    }

    /// Overrides the simulated per-read latency. Zero makes the device
    /// answer instantly, which the timing tests rely on.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    fn key(&self) -> &str {
        &self.key
    }

    fn connection(&self) -> ConnectionState {
        self.flag.state()
    }

    async fn connect(&mut self, address: &str) -> RigResult<()> {
        info!("[{}] connect: simulated device on '{}'", self.key, address);
        self.flag.set(true);
        Ok(())
    }

    async fn fetch(&mut self) -> RigResult<Option<Reading>> {
        if !self.flag.is_connected() {
            return Ok(None);
        }

        if !self.latency.is_zero() {
            let jitter = rand::thread_rng().gen_range(0.5..1.0);
            tokio::time::sleep(self.latency.mul_f64(jitter)).await;
        }

        let t = self.clock.elapsed_secs();
        let phase = 2.0 * std::f64::consts::PI * self.frequency * t;
        let reading = Reading::new(
            t,
            self.clock.wall_time(),
            [
                ("y1".to_string(), 20.0 * phase.sin() + 20.0),
                ("y2".to_string(), 20.0 * phase.cos() + 20.0),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_data_until_connected() {
        let clock = RunClock::new();
        let mut dev = SimulatedDevice::new("test1", 1.0, 16, clock);
        assert!(dev.fetch().await.unwrap().is_none());

        dev.connect("sim").await.unwrap();
        assert!(dev.fetch().await.unwrap().is_some());
        assert_eq!(dev.connection(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_fetch_buffers_the_reading() {
        let clock = RunClock::new();
        let mut dev = SimulatedDevice::new("test1", 1.0, 16, clock)
            .with_latency(Duration::ZERO);
        dev.connect("sim").await.unwrap();

        dev.fetch().await.unwrap();
        dev.fetch().await.unwrap();
        assert_eq!(dev.data().drain().len(), 2);
    }

    #[tokio::test]
    async fn test_values_follow_the_waveform() {
        let clock = RunClock::new();
        let mut dev = SimulatedDevice::new("test1", 0.5, 16, clock)
            .with_latency(Duration::ZERO);
        dev.connect("sim").await.unwrap();

        let reading = dev.fetch().await.unwrap().unwrap();
        let y1 = reading.values["y1"];
        let y2 = reading.values["y2"];
        assert!((0.0..=40.0).contains(&y1));
        assert!((0.0..=40.0).contains(&y2));
    }
}
