//! Transport contracts for the physical buses.
//!
//! The low-level drivers (vendor flow-controller protocol, the sensor
//! board's CDC-ACM firmware link, RS-232) live outside this crate; the rig
//! only depends on the narrow contracts here. Every implementation must
//! bound its own I/O: a call that cannot complete within its budget
//! (~150-250 ms for a flow-controller exchange; a fixed retry count with
//! 30-50 ms spacing for the sensor protocol) returns a timeout error
//! instead of stalling the polling loop. None of these calls retry
//! connection establishment.
//!
//! Simulated implementations ship here for bench use and tests; a
//! `serialport`-backed pressure transport is available behind the
//! `instrument_serial` feature.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RigResult;

#[cfg(feature = "instrument_serial")]
use crate::error::RigError;

/// One multi-field sample from a flow controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowSample {
    /// Commanded setpoint [sccm]
    pub setpoint: f64,
    /// Measured mass flow [sccm]
    pub mass_flow: f64,
    /// Measured volumetric flow [ccm]
    pub volumetric_flow: f64,
    /// Line pressure [psia]
    pub pressure: f64,
    /// Gas temperature [degC]
    pub temperature: f64,
}

/// Vendor link to one mass flow controller.
#[async_trait]
pub trait FlowTransport: Send {
    /// One connection attempt; no internal retry.
    async fn open(&mut self, address: &str) -> RigResult<()>;

    /// Reads one full sample. Takes ~200 ms on real hardware.
    async fn sample(&mut self) -> RigResult<FlowSample>;

    /// Writes a new flow setpoint. Takes ~200 ms on real hardware.
    async fn write_setpoint(&mut self, sccm: f64) -> RigResult<()>;
}

/// The sensor board link, shared by every humidity probe on the bus.
///
/// One request/reply exchange per probe read: the board is asked for the
/// probe at `addr` and answers with the raw 7-bit reply payload, which the
/// codec decodes. Implementations wait out their retry budget internally
/// and report [`crate::error::RigError::Timeout`] when it is exhausted.
#[async_trait]
pub trait SensorBus: Send + Sync {
    /// Registers a probe address with the board firmware.
    async fn attach(&self, addr: u8) -> RigResult<()>;

    /// Issues a read request and returns the raw septet payload.
    async fn exchange(&self, addr: u8) -> RigResult<Vec<u8>>;
}

/// RS-232 link to the pressure transducer.
#[async_trait]
pub trait PressureTransport: Send {
    /// One connection attempt; no internal retry.
    async fn open(&mut self, address: &str) -> RigResult<()>;

    /// Queries one pressure reading [psig].
    async fn query(&mut self) -> RigResult<f64>;
}

// ============================================================================
// Simulated transports
// ============================================================================

/// First-order flow model: the measured flow relaxes toward the setpoint a
/// little on every sample, with sensor noise on top.
pub struct SimulatedFlowTransport {
    setpoint: f64,
    flow: f64,
}

impl SimulatedFlowTransport {
    pub fn new() -> Self {
        Self {
            setpoint: 0.0,
            flow: 0.0,
        }
    }
}

impl Default for SimulatedFlowTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowTransport for SimulatedFlowTransport {
    async fn open(&mut self, _address: &str) -> RigResult<()> {
        Ok(())
    }

    async fn sample(&mut self) -> RigResult<FlowSample> {
        // Keep well under the real ~200 ms exchange so tests stay fast.
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.flow += (self.setpoint - self.flow) * 0.3;

        let noise = rand::thread_rng().gen_range(-0.05..0.05);
        Ok(FlowSample {
            setpoint: self.setpoint,
            mass_flow: self.flow + noise,
            volumetric_flow: (self.flow + noise) * 1.02,
            pressure: 14.7,
            temperature: 22.5,
        })
    }

    async fn write_setpoint(&mut self, sccm: f64) -> RigResult<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.setpoint = sccm;
        Ok(())
    }
}

/// Simulated sensor board holding a slowly drifting humidity value.
///
/// Unattached addresses answer with the firmware's all-0xFF sentinel, the
/// same way the real board reports an empty bus position.
pub struct SimulatedSensorBus {
    attached: Mutex<HashSet<u8>>,
    state: Mutex<(f64, f64)>,
}

impl SimulatedSensorBus {
    pub fn new(humidity: f64, temperature: f64) -> Self {
        Self {
            attached: Mutex::new(HashSet::new()),
            state: Mutex::new((humidity, temperature)),
        }
    }

    /// Shifts the simulated humidity, clamped to [0, 100].
    pub fn drift(&self, delta: f64) {
        let mut state = lock(&self.state);
        state.0 = (state.0 + delta).clamp(0.0, 100.0);
    }

    /// Encodes (humidity, temperature) the way the sensor firmware frames
    /// its reply: address echo plus four data bytes, split into septets.
    fn encode(addr: u8, humidity: f64, temperature: f64) -> Vec<u8> {
        let h_raw = ((humidity / 100.0) * 16384.0) as u16 & 0x3FFF;
        let t_raw = (((temperature + 40.0) / 165.0) * 16384.0) as u16 & 0x3FFF;

        let bytes = [
            addr,
            (h_raw >> 8) as u8,
            (h_raw & 0xFF) as u8,
            (t_raw >> 6) as u8,
            ((t_raw & 0x3F) << 2) as u8,
        ];
        bytes.iter().flat_map(|&b| [b & 0x7F, b >> 7]).collect()
    }

    fn sentinel(addr: u8) -> Vec<u8> {
        [addr, 0xFF, 0xFF, 0xFF, 0xFF]
            .iter()
            .flat_map(|&b| [b & 0x7F, b >> 7])
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl SensorBus for SimulatedSensorBus {
    async fn attach(&self, addr: u8) -> RigResult<()> {
        lock(&self.attached).insert(addr);
        Ok(())
    }

    async fn exchange(&self, addr: u8) -> RigResult<Vec<u8>> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if !lock(&self.attached).contains(&addr) {
            return Ok(Self::sentinel(addr));
        }
        let (h, t) = *lock(&self.state);
        Ok(Self::encode(addr, h, t))
    }
}

// ============================================================================
// Serial pressure transport (PX409 family)
// ============================================================================

/// RS-232 transport for the PX409 pressure transducer.
///
/// The transducer answers the ASCII command `P\r` with one line whose first
/// whitespace-separated token is the pressure in psig. The blocking
/// `serialport` handle is driven from `spawn_blocking` so a slow line never
/// stalls the scheduler task.
#[cfg(feature = "instrument_serial")]
pub struct SerialPressureTransport {
    baud_rate: u32,
    timeout: Duration,
    port: Option<std::sync::Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialPressureTransport {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self {
            baud_rate,
            timeout,
            port: None,
        }
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl PressureTransport for SerialPressureTransport {
    async fn open(&mut self, address: &str) -> RigResult<()> {
        let port = serialport::new(address, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| RigError::Connection {
                device: address.to_string(),
                reason: e.to_string(),
            })?;
        self.port = Some(std::sync::Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn query(&mut self) -> RigResult<f64> {
        use std::io::{BufRead, BufReader, Write};

        let port = self
            .port
            .as_ref()
            .ok_or_else(|| RigError::Connection {
                device: "pressure".to_string(),
                reason: "port not open".to_string(),
            })?
            .clone();

        let line = tokio::task::spawn_blocking(move || -> RigResult<String> {
            let mut guard = lock(&port);
            guard.write_all(b"P\r")?;
            guard.flush()?;

            let mut reader = BufReader::new(guard.as_mut());
            let mut line = String::new();
            reader.read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| RigError::MalformedReply(format!("serial task failed: {e}")))??;

        line.split_whitespace()
            .next()
            .ok_or_else(|| RigError::MalformedReply("empty pressure reply".to_string()))?
            .parse::<f64>()
            .map_err(|e| RigError::MalformedReply(format!("bad pressure value: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[tokio::test]
    async fn test_simulated_flow_relaxes_toward_setpoint() {
        let mut t = SimulatedFlowTransport::new();
        t.open("sim").await.unwrap();
        t.write_setpoint(50.0).await.unwrap();

        let mut last = 0.0;
        for _ in 0..20 {
            last = t.sample().await.unwrap().mass_flow;
        }
        assert!((last - 50.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_simulated_bus_round_trips_through_codec() {
        let bus = SimulatedSensorBus::new(42.0, 21.0);
        bus.attach(0x54).await.unwrap();

        let septets = bus.exchange(0x54).await.unwrap();
        let sample = codec::decode_reply(&septets).unwrap();
        assert!((sample.humidity - 42.0).abs() < 0.05);
        assert!((sample.temperature - 21.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn test_unattached_address_reports_absent() {
        let bus = SimulatedSensorBus::new(42.0, 21.0);
        let septets = bus.exchange(0x11).await.unwrap();
        assert!(matches!(
            codec::decode_reply(&septets),
            Err(crate::error::RigError::DeviceAbsent)
        ));
    }
}
