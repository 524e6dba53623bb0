//! Headless entry point for the humidity-control rig.
//!
//! Loads the configuration, builds the device registry, and runs the
//! polling scheduler until interrupted. The dashboard layer attaches to
//! the running rig through a `SchedulerHandle`; on the bench without
//! hardware the simulated transports stand in for the real buses.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use hygrostat::clock::RunClock;
use hygrostat::config::{DeviceKind, Settings, DEFAULT_CONFIG_PATH};
use hygrostat::device::{
    DeviceRegistry, FlowController, HumidityProbe, PressureSensor, SimulatedDevice,
};
use hygrostat::scheduler::Scheduler;
use hygrostat::transport::{SimulatedFlowTransport, SimulatedSensorBus};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "hygrostat", about = "Laboratory humidity-control rig runtime")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(cli: &Cli, settings: &Settings) {
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&settings.application.log_level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Builds the startup-fixed device registry from the `[[devices]]`
/// configuration entries.
///
/// All humidity probes share one sensor bus, the same way every probe on
/// the rig hangs off the single interface board. Binding that board is a
/// process-wide resource: if it fails, startup fails.
fn build_registry(settings: &Settings, clock: &RunClock) -> Result<DeviceRegistry> {
    let capacity = settings.scheduler.buffer_capacity;
    let bus = Arc::new(SimulatedSensorBus::new(45.0, 21.0));

    let mut registry = DeviceRegistry::new();
    for def in &settings.devices {
        match def.kind {
            DeviceKind::Simulated => {
                registry.insert(Box::new(SimulatedDevice::new(
                    &def.key,
                    def.frequency,
                    capacity,
                    clock.clone(),
                )));
            }
            DeviceKind::FlowController => {
                registry.insert(Box::new(FlowController::new(
                    &def.key,
                    Box::new(SimulatedFlowTransport::new()),
                    capacity,
                    clock.clone(),
                )));
            }
            DeviceKind::HumidityProbe => {
                registry.insert(Box::new(HumidityProbe::new(
                    &def.key,
                    bus.clone(),
                    capacity,
                    clock.clone(),
                )));
            }
            DeviceKind::PressureSensor => {
                registry.insert(Box::new(PressureSensor::new(
                    &def.key,
                    pressure_transport()?,
                    capacity,
                    clock.clone(),
                )));
            }
        }
    }

    Ok(registry)
}

#[cfg(feature = "instrument_serial")]
fn pressure_transport() -> Result<Box<dyn hygrostat::transport::PressureTransport>> {
    Ok(Box::new(hygrostat::transport::SerialPressureTransport::new(
        115_200,
        std::time::Duration::from_secs(1),
    )))
}

#[cfg(not(feature = "instrument_serial"))]
fn pressure_transport() -> Result<Box<dyn hygrostat::transport::PressureTransport>> {
    // Without serial support the transducer slot runs against a fixed
    // simulated line pressure.
    use async_trait::async_trait;
    use hygrostat::error::RigResult;
    use hygrostat::transport::PressureTransport;

    struct SimulatedPressure;

    #[async_trait]
    impl PressureTransport for SimulatedPressure {
        async fn open(&mut self, _address: &str) -> RigResult<()> {
            Ok(())
        }
        async fn query(&mut self) -> RigResult<f64> {
            Ok(14.7)
        }
    }

    Ok(Box::new(SimulatedPressure))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load_from(&cli.config).context("Failed to load configuration")?;
    init_logging(&cli, &settings);

    info!(
        "{} starting with {} configured devices",
        settings.application.name,
        settings.devices.len()
    );

    let clock = RunClock::new();
    let registry = build_registry(&settings, &clock).context("Failed to build device registry")?;
    let settings = Arc::new(settings);

    let (scheduler, handle) = Scheduler::new(settings, registry, clock);
    let scheduler_task = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("interrupt received, shutting down");

    let (cmd, done) = hygrostat::command::RigCommand::shutdown();
    if handle.send(cmd).is_ok() {
        let _ = done.await;
    }
    scheduler_task.await.context("Scheduler task failed")?;

    Ok(())
}
