//! Fixed-period polling and control loop.
//!
//! One long-lived task owns every device, all actuator writes, the
//! display windows, and the control state. Each tick it:
//!
//! 1. Drains the command queue and executes the batch that was present at
//!    tick start (commands arriving mid-tick wait for the next tick).
//!    Commands addressed to distinct devices are dispatched concurrently
//!    and jointly awaited; commands for one device keep FIFO order.
//! 2. Polls every registered device once, concurrently — except the
//!    tracked sensor while a closed-loop mode owns its read — and pushes
//!    each reading into the per-device display window.
//! 3. In a closed-loop mode, evaluates the setpoint program at the time
//!    elapsed since the mode was engaged, feeds the PID controller from a
//!    direct read of the tracked sensor, and splits the configured total
//!    flow across the two actuators by the control signal.
//! 4. Sleeps for whatever remains of the tick period.
//!
//! A failed poll or command never stops the loop. Losing the tracked
//! sensor mid-control skips that tick's actuation and retries next tick;
//! the mode is never downgraded automatically.

use futures::future::{join_all, BoxFuture};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::clock::RunClock;
use crate::command::{CommandReceiver, CommandSender, ModeRequest, RigCommand};
use crate::config::Settings;
use crate::device::{
    BufferHandle, ConnectionFlag, Device, DeviceRegistry, DisplayWindow, Reading,
};
use crate::error::{RigError, RigResult};
use crate::pid::Pid;
use crate::program::SetpointProgram;

/// Active control strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControlMode {
    Manual,
    SetpointTracking,
    ArbitraryProgram,
}

/// State carried by the two closed-loop modes.
struct TrackingLoop {
    mode: ControlMode,
    program: SetpointProgram,
    pid: Pid,
    /// Run-clock seconds when the mode was engaged
    engaged_at: f64,
}

enum ControlState {
    Manual,
    Tracking(TrackingLoop),
}

impl ControlState {
    fn mode(&self) -> ControlMode {
        match self {
            ControlState::Manual => ControlMode::Manual,
            ControlState::Tracking(t) => t.mode,
        }
    }
}

type DisplayMap = Arc<Mutex<HashMap<String, DisplayWindow>>>;

/// External surface of a running scheduler: enqueue commands, drain
/// buffers, read connection status and display windows.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: CommandSender,
    buffers: HashMap<String, BufferHandle>,
    status: HashMap<String, ConnectionFlag>,
    displays: DisplayMap,
    mode: Arc<Mutex<ControlMode>>,
}

impl SchedulerHandle {
    /// Enqueues a command. Never blocks; fails only once the scheduler
    /// has shut down.
    pub fn send(&self, command: RigCommand) -> RigResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RigError::Validation("scheduler is no longer running".to_string()))
    }

    /// Drains a device's ring buffer from outside the loop.
    pub fn drain(&self, key: &str) -> RigResult<Vec<Reading>> {
        self.buffers
            .get(key)
            .map(BufferHandle::drain)
            .ok_or_else(|| RigError::UnknownDevice(key.to_string()))
    }

    /// Drains a device's buffer into the rig's outbound JSON shape, an
    /// ordered array of `{timestamp, datetime, values}` records. This is
    /// what the dashboard layer serves per fetch request.
    pub fn drain_json(&self, key: &str) -> RigResult<serde_json::Value> {
        let readings = self.drain(key)?;
        Ok(serde_json::to_value(readings)?)
    }

    /// Connection status of a device.
    pub fn is_connected(&self, key: &str) -> RigResult<bool> {
        self.status
            .get(key)
            .map(ConnectionFlag::is_connected)
            .ok_or_else(|| RigError::UnknownDevice(key.to_string()))
    }

    /// Copy of a device's display window, oldest first.
    pub fn display(&self, key: &str) -> RigResult<Vec<Reading>> {
        let displays = lock(&self.displays);
        displays
            .get(key)
            .map(DisplayWindow::snapshot)
            .ok_or_else(|| RigError::UnknownDevice(key.to_string()))
    }

    /// Currently active control mode.
    pub fn control_mode(&self) -> ControlMode {
        *lock(&self.mode)
    }

    /// Registered device keys.
    pub fn keys(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The polling loop. Constructed once at startup; `run` consumes it.
pub struct Scheduler {
    settings: Arc<Settings>,
    registry: DeviceRegistry,
    displays: DisplayMap,
    clock: RunClock,
    command_rx: CommandReceiver,
    control: ControlState,
    mode_cell: Arc<Mutex<ControlMode>>,
}

impl Scheduler {
    pub fn new(
        settings: Arc<Settings>,
        registry: DeviceRegistry,
        clock: RunClock,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = crate::command::command_channel();

        let displays: DisplayMap = Arc::new(Mutex::new(
            registry
                .keys()
                .map(|k| {
                    (
                        k.to_string(),
                        DisplayWindow::new(settings.scheduler.display_window),
                    )
                })
                .collect(),
        ));
        let mode_cell = Arc::new(Mutex::new(ControlMode::Manual));

        let handle = SchedulerHandle {
            commands: command_tx,
            buffers: registry.buffer_handles(),
            status: registry.status_flags(),
            displays: Arc::clone(&displays),
            mode: Arc::clone(&mode_cell),
        };

        (
            Self {
                settings,
                registry,
                displays,
                clock,
                command_rx,
                control: ControlState::Manual,
                mode_cell,
            },
            handle,
        )
    }

    /// Runs until a Shutdown command arrives.
    pub async fn run(mut self) {
        let period = self.settings.scheduler.tick_period;
        info!(
            "scheduler started: {} devices, {:?} tick period",
            self.registry.len(),
            period
        );

        loop {
            let tick_start = Instant::now();
            if !self.tick().await {
                break;
            }

            let remaining = period.saturating_sub(tick_start.elapsed());
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }
        }

        // Leave no half-written recording files behind.
        for device in self.registry.iter_mut() {
            device.data_mut().stop_recording();
        }
        info!("scheduler stopped");
    }

    /// One tick. Returns false once a Shutdown command has executed.
    async fn tick(&mut self) -> bool {
        // Only commands already queued at tick start run this tick.
        let mut batch = Vec::new();
        while let Ok(cmd) = self.command_rx.try_recv() {
            batch.push(cmd);
        }

        if !self.execute_batch(batch).await {
            return false;
        }
        self.poll_devices().await;
        self.control_step().await;
        true
    }

    /// Executes one tick's command batch. Overall arrival order is kept;
    /// consecutive device-addressed commands are fanned out per device
    /// and jointly awaited before the batch continues.
    async fn execute_batch(&mut self, batch: Vec<RigCommand>) -> bool {
        let mut keep_running = true;
        let mut device_group: Vec<RigCommand> = Vec::new();

        for cmd in batch {
            if cmd.target().is_some() {
                device_group.push(cmd);
            } else {
                self.flush_device_group(&mut device_group).await;
                if !self.execute_inline(cmd) {
                    keep_running = false;
                }
            }
        }
        self.flush_device_group(&mut device_group).await;

        keep_running
    }

    /// Dispatches a group of device-addressed commands: per-device FIFO,
    /// devices concurrent, all awaited before returning.
    async fn flush_device_group(&mut self, group: &mut Vec<RigCommand>) {
        if group.is_empty() {
            return;
        }

        let manual_writes_locked = !matches!(self.control, ControlState::Manual);

        let mut per_device: Vec<(String, Vec<RigCommand>)> = Vec::new();
        for cmd in group.drain(..) {
            // Direct actuator writes are disabled while a closed-loop
            // mode owns the actuators.
            if manual_writes_locked {
                if let RigCommand::SetOutput { key, response, .. } = cmd {
                    warn!("[{key}] set_output rejected: closed-loop control is active");
                    let _ = response.send(Err(RigError::Validation(
                        "manual output writes are disabled while closed-loop control is active"
                            .to_string(),
                    )));
                    continue;
                }
            }

            let Some(key) = cmd.target().map(str::to_string) else {
                continue;
            };
            match per_device.iter_mut().find(|(k, _)| *k == key) {
                Some((_, cmds)) => cmds.push(cmd),
                None => per_device.push((key, vec![cmd])),
            }
        }

        let mut jobs: Vec<BoxFuture<'static, Box<dyn Device>>> = Vec::new();
        for (key, cmds) in per_device {
            match self.registry.take(&key) {
                Some(mut device) => {
                    jobs.push(Box::pin(async move {
                        for cmd in cmds {
                            run_device_command(device.as_mut(), cmd).await;
                        }
                        device
                    }));
                }
                None => {
                    for cmd in cmds {
                        warn!("[{key}] {}: unknown device", cmd.operation());
                        respond_unknown_device(&key, cmd);
                    }
                }
            }
        }

        for device in join_all(jobs).await {
            self.registry.restore(device);
        }
    }

    /// Executes a non-device command. Returns false for Shutdown.
    fn execute_inline(&mut self, cmd: RigCommand) -> bool {
        match cmd {
            RigCommand::SetControlMode { request, response } => {
                let result = self.switch_mode(request);
                let _ = response.send(result);
            }

            RigCommand::StartRecording {
                directory,
                response,
            } => {
                let _ = response.send(self.start_recording(directory));
            }

            RigCommand::StopRecording { response } => {
                for device in self.registry.iter_mut() {
                    device.data_mut().stop_recording();
                }
                info!("recording stopped");
                let _ = response.send(());
            }

            RigCommand::ResetClock { response } => {
                self.clock.reset();
                info!("run clock reset");
                let _ = response.send(());
            }

            RigCommand::Shutdown { response } => {
                info!("shutdown command received");
                let _ = response.send(());
                return false;
            }

            // Device-addressed commands never reach here.
            RigCommand::Connect { .. } | RigCommand::SetOutput { .. } => {}
        }
        true
    }

    fn switch_mode(&mut self, request: ModeRequest) -> RigResult<()> {
        let name = request.name();
        match request {
            ModeRequest::Manual => {
                self.control = ControlState::Manual;
            }
            ModeRequest::SetpointTracking(program) | ModeRequest::ArbitraryProgram(program) => {
                let mode = if matches!(program, SetpointProgram::Sampled { .. }) {
                    ControlMode::ArbitraryProgram
                } else {
                    ControlMode::SetpointTracking
                };

                let sensor = &self.settings.control.sensor;
                if !self.registry.contains(sensor) {
                    return Err(RigError::UnknownDevice(sensor.clone()));
                }

                let control = &self.settings.control;
                let mut pid =
                    Pid::new(control.kp, control.ki, control.kd).with_output_limits(0.0, 1.0);
                pid.reset();

                self.control = ControlState::Tracking(TrackingLoop {
                    mode,
                    program,
                    pid,
                    engaged_at: self.clock.elapsed_secs(),
                });
            }
        }

        *lock(&self.mode_cell) = self.control.mode();
        info!("control mode switched to {name}");
        Ok(())
    }

    fn start_recording(&mut self, directory: Option<PathBuf>) -> RigResult<()> {
        let directory = directory.unwrap_or_else(|| self.settings.storage.output_dir.clone());
        std::fs::create_dir_all(&directory)?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");

        for device in self.registry.iter_mut() {
            // Recording is scoped to connected devices; the rest keep
            // running without a sink.
            if device.connection() != crate::device::ConnectionState::Connected {
                continue;
            }
            let path = directory.join(format!("{}_{}.csv", device.key(), stamp));
            let key = device.key().to_string();
            device.data_mut().start_recording(&path)?;
            info!("[{key}] recording to {}", path.display());
        }
        Ok(())
    }

    /// Polls every device once, concurrently, skipping the tracked
    /// sensor while a closed-loop mode owns its read.
    async fn poll_devices(&mut self) {
        let excluded = match &self.control {
            ControlState::Tracking(_) => Some(self.settings.control.sensor.clone()),
            ControlState::Manual => None,
        };

        let polls = self
            .registry
            .iter_mut()
            .filter(|d| excluded.as_deref() != Some(d.key()))
            .map(|device| async move {
                let key = device.key().to_string();
                match device.fetch().await {
                    Ok(reading) => (key, reading),
                    Err(e) => {
                        error!("[{key}] fetch: {e}");
                        (key, None)
                    }
                }
            });

        let results = join_all(polls).await;

        let mut displays = lock(&self.displays);
        for (key, reading) in results {
            if let (Some(window), Some(reading)) = (displays.get_mut(&key), reading) {
                window.push(reading);
            }
        }
    }

    /// Closed-loop step: program -> PID -> two actuator outputs.
    async fn control_step(&mut self) {
        let dt = self.settings.scheduler.tick_period.as_secs_f64();
        let sensor_key = self.settings.control.sensor.clone();

        let ControlState::Tracking(tracking) = &mut self.control else {
            return;
        };

        let elapsed = self.clock.elapsed_secs() - tracking.engaged_at;
        let target = match tracking.program.evaluate(elapsed) {
            Ok(target) => target,
            Err(e) => {
                warn!("control: {e}; skipping actuation this tick");
                return;
            }
        };
        tracking.pid.set_setpoint(target);

        // The control strategy owns this read; the general poll excluded
        // the sensor so the scarce reading is consumed exactly once.
        let Some(sensor) = self.registry.get_mut(&sensor_key) else {
            error!("[{sensor_key}] control: tracked sensor not registered");
            return;
        };
        let reading = match sensor.fetch().await {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                warn!("[{sensor_key}] control: no reading, skipping actuation this tick");
                return;
            }
            Err(e) => {
                warn!("[{sensor_key}] control: {e}; skipping actuation this tick");
                return;
            }
        };

        let Some(&measured) = reading.values.get("humidity") else {
            error!("[{sensor_key}] control: reading carries no humidity field");
            return;
        };

        let signal = tracking.pid.compute(measured, dt);

        {
            let mut displays = lock(&self.displays);
            if let Some(window) = displays.get_mut(&sensor_key) {
                window.push(reading);
            }
        }

        // Split the total flow by the control signal: wetter means more
        // flow through the bubbler line.
        let total = self.settings.control.total_flow;
        let outputs = [
            (
                self.settings.control.dry_flow.clone(),
                (total * (1.0 - signal)).clamp(0.0, 100.0),
            ),
            (
                self.settings.control.wet_flow.clone(),
                (total * signal).clamp(0.0, 100.0),
            ),
        ];

        for (key, output) in outputs {
            match self.registry.get_mut(&key) {
                Some(actuator) => {
                    if let Err(e) = actuator.set_output(output).await {
                        error!("[{key}] control set_output: {e}");
                    }
                }
                None => error!("[{key}] control: actuator not registered"),
            }
        }
    }
}

/// Executes one device-addressed command against its (taken) device.
async fn run_device_command(device: &mut dyn Device, cmd: RigCommand) {
    match cmd {
        RigCommand::Connect {
            key,
            address,
            response,
        } => {
            let result = device.connect(&address).await;
            if let Err(e) = &result {
                error!("[{key}] connect: {e}");
            }
            let _ = response.send(result);
        }
        RigCommand::SetOutput {
            key,
            value,
            response,
        } => {
            let result = device.set_output(value).await;
            if let Err(e) = &result {
                error!("[{key}] set_output: {e}");
            }
            let _ = response.send(result);
        }
        _ => {}
    }
}

/// Answers a device-addressed command whose key matched nothing.
fn respond_unknown_device(key: &str, cmd: RigCommand) {
    let err = || Err(RigError::UnknownDevice(key.to_string()));
    match cmd {
        RigCommand::Connect { response, .. } => {
            let _ = response.send(err());
        }
        RigCommand::SetOutput { response, .. } => {
            let _ = response.send(err());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use std::time::Duration;

    fn test_settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.scheduler.tick_period = Duration::from_millis(50);
        settings.scheduler.buffer_capacity = 64;
        Arc::new(settings)
    }

    fn simulated_registry(clock: &RunClock) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for key in ["test1", "test2"] {
            registry.insert(Box::new(
                SimulatedDevice::new(key, 1.0, 64, clock.clone())
                    .with_latency(Duration::ZERO),
            ));
        }
        registry
    }

    #[tokio::test]
    async fn test_commands_present_at_tick_start_all_execute() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd_a, rx_a) = RigCommand::connect("test1", "sim").unwrap();
        let (cmd_b, rx_b) = RigCommand::connect("test2", "sim").unwrap();
        handle.send(cmd_a).unwrap();
        handle.send(cmd_b).unwrap();

        assert!(scheduler.tick().await);
        rx_a.await.unwrap().unwrap();
        rx_b.await.unwrap().unwrap();
        assert!(handle.is_connected("test1").unwrap());
        assert!(handle.is_connected("test2").unwrap());
    }

    #[tokio::test]
    async fn test_queue_snapshot_excludes_later_commands() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd, _rx) = RigCommand::connect("test1", "sim").unwrap();
        handle.send(cmd).unwrap();
        assert!(scheduler.tick().await);

        // Enqueued after the drain: waits for the next tick.
        let (cmd, rx) = RigCommand::connect("test2", "sim").unwrap();
        handle.send(cmd).unwrap();
        assert!(!handle.is_connected("test2").unwrap());

        assert!(scheduler.tick().await);
        rx.await.unwrap().unwrap();
        assert!(handle.is_connected("test2").unwrap());
    }

    #[tokio::test]
    async fn test_unknown_device_command_is_answered() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd, rx) = RigCommand::connect("nope", "sim").unwrap();
        handle.send(cmd).unwrap();
        scheduler.tick().await;

        assert!(matches!(
            rx.await.unwrap(),
            Err(RigError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_ends_the_loop() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd, rx) = RigCommand::shutdown();
        handle.send(cmd).unwrap();
        assert!(!scheduler.tick().await);
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_fills_displays_and_buffers() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd, _rx) = RigCommand::connect("test1", "sim").unwrap();
        handle.send(cmd).unwrap();

        for _ in 0..3 {
            scheduler.tick().await;
        }

        // Connected on tick 1, polled on ticks 1..=3.
        assert_eq!(handle.drain("test1").unwrap().len(), 3);
        assert_eq!(handle.display("test1").unwrap().len(), 3);
        // Never connected: nothing buffered.
        assert!(handle.drain("test2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_json_matches_outbound_shape() {
        let clock = RunClock::new();
        let (mut scheduler, handle) = Scheduler::new(test_settings(), simulated_registry(&clock), clock);

        let (cmd, _rx) = RigCommand::connect("test1", "sim").unwrap();
        handle.send(cmd).unwrap();
        scheduler.tick().await;

        let json = handle.drain_json("test1").unwrap();
        let records = json.as_array().unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert!(record["timestamp"].is_number());
        assert!(record["datetime"].is_string());
        assert!(record["values"]["y1"].is_number());
        assert!(record["values"]["y2"].is_number());
    }
}
