//! Command types for the scheduler's single-consumer queue.
//!
//! External actors (the dashboard layer) construct commands through the
//! helper constructors here and push them onto an unbounded channel; the
//! scheduler is the sole consumer and executes a command exactly once.
//! Every command carries a `oneshot` sender so the caller can await the
//! outcome without sharing any state with the polling loop.
//!
//! Argument validation happens in the constructors: a malformed command
//! (non-finite output, empty key, bad program parameters) is rejected
//! here and never enqueued.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RigError, RigResult};
use crate::program::{ExpressionSampler, ProgramSegment, SetpointProgram};

/// Enqueue side of the command queue. Sending never blocks.
pub type CommandSender = mpsc::UnboundedSender<RigCommand>;

/// Scheduler side of the command queue.
pub type CommandReceiver = mpsc::UnboundedReceiver<RigCommand>;

/// Creates the command channel pair.
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Requested control strategy plus its setpoint source.
#[derive(Debug)]
pub enum ModeRequest {
    /// Direct numeric actuator writes only
    Manual,
    /// Track a constant or step setpoint program
    SetpointTracking(SetpointProgram),
    /// Track a sampled expression program
    ArbitraryProgram(SetpointProgram),
}

impl ModeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ModeRequest::Manual => "manual",
            ModeRequest::SetpointTracking(_) => "setpoint_tracking",
            ModeRequest::ArbitraryProgram(_) => "arbitrary_program",
        }
    }
}

/// One externally issued operation, consumed exactly once by the
/// scheduler.
#[derive(Debug)]
pub enum RigCommand {
    /// Connect a device to a transport address
    Connect {
        key: String,
        address: String,
        response: oneshot::Sender<RigResult<()>>,
    },

    /// Write a manual actuator output
    SetOutput {
        key: String,
        value: f64,
        response: oneshot::Sender<RigResult<()>>,
    },

    /// Switch the control strategy
    SetControlMode {
        request: ModeRequest,
        response: oneshot::Sender<RigResult<()>>,
    },

    /// Open one recording sink per connected device under `directory`,
    /// or under the configured storage directory when `None`
    StartRecording {
        directory: Option<PathBuf>,
        response: oneshot::Sender<RigResult<()>>,
    },

    /// Flush and close all recording sinks
    StopRecording { response: oneshot::Sender<()> },

    /// Move the shared run clock epoch to now
    ResetClock { response: oneshot::Sender<()> },

    /// Exit the polling loop gracefully
    Shutdown { response: oneshot::Sender<()> },
}

impl RigCommand {
    /// Helper to create a Connect command.
    pub fn connect(
        key: impl Into<String>,
        address: impl Into<String>,
    ) -> RigResult<(Self, oneshot::Receiver<RigResult<()>>)> {
        let key = key.into();
        let address = address.into();
        if key.is_empty() {
            return Err(RigError::Validation("device key is empty".to_string()));
        }
        if address.is_empty() {
            return Err(RigError::Validation("address is empty".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        Ok((
            Self::Connect {
                key,
                address,
                response: tx,
            },
            rx,
        ))
    }

    /// Helper to create a SetOutput command.
    pub fn set_output(
        key: impl Into<String>,
        value: f64,
    ) -> RigResult<(Self, oneshot::Receiver<RigResult<()>>)> {
        let key = key.into();
        if key.is_empty() {
            return Err(RigError::Validation("device key is empty".to_string()));
        }
        if !value.is_finite() {
            return Err(RigError::Validation(format!(
                "output value {value} is not a finite number"
            )));
        }

        let (tx, rx) = oneshot::channel();
        Ok((
            Self::SetOutput {
                key,
                value,
                response: tx,
            },
            rx,
        ))
    }

    /// Helper to switch to manual mode.
    pub fn manual_mode() -> (Self, oneshot::Receiver<RigResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetControlMode {
                request: ModeRequest::Manual,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to engage setpoint tracking at a constant target.
    pub fn track_constant(setpoint: f64) -> RigResult<(Self, oneshot::Receiver<RigResult<()>>)> {
        let program = SetpointProgram::constant(setpoint)?;
        let (tx, rx) = oneshot::channel();
        Ok((
            Self::SetControlMode {
                request: ModeRequest::SetpointTracking(program),
                response: tx,
            },
            rx,
        ))
    }

    /// Helper to engage setpoint tracking over step breakpoints
    /// (ascending seconds).
    pub fn track_steps(
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> RigResult<(Self, oneshot::Receiver<RigResult<()>>)> {
        let program = SetpointProgram::steps(times, values)?;
        let (tx, rx) = oneshot::channel();
        Ok((
            Self::SetControlMode {
                request: ModeRequest::SetpointTracking(program),
                response: tx,
            },
            rx,
        ))
    }

    /// Helper to engage an arbitrary expression program. The segments are
    /// sampled here, at the command boundary, so the scheduler never
    /// touches the expression engine.
    pub fn track_program(
        segments: &[ProgramSegment],
        sampler: &dyn ExpressionSampler,
    ) -> RigResult<(Self, oneshot::Receiver<RigResult<()>>)> {
        let program = SetpointProgram::from_segments(segments, sampler)?;
        let (tx, rx) = oneshot::channel();
        Ok((
            Self::SetControlMode {
                request: ModeRequest::ArbitraryProgram(program),
                response: tx,
            },
            rx,
        ))
    }

    /// Helper to create a StartRecording command targeting `directory`.
    pub fn start_recording(
        directory: impl Into<PathBuf>,
    ) -> (Self, oneshot::Receiver<RigResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRecording {
                directory: Some(directory.into()),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StartRecording command using the configured
    /// storage directory.
    pub fn start_recording_default() -> (Self, oneshot::Receiver<RigResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRecording {
                directory: None,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopRecording command.
    pub fn stop_recording() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRecording { response: tx }, rx)
    }

    /// Helper to create a ResetClock command.
    pub fn reset_clock() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::ResetClock { response: tx }, rx)
    }

    /// Helper to create a Shutdown command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }

    /// Key of the device this command addresses, if any. Commands with a
    /// target are grouped per device so independent devices can execute
    /// concurrently within a tick.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Connect { key, .. } | Self::SetOutput { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Short operation name for log lines.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::SetOutput { .. } => "set_output",
            Self::SetControlMode { .. } => "set_control_mode",
            Self::StartRecording { .. } => "start_recording",
            Self::StopRecording { .. } => "stop_recording",
            Self::ResetClock { .. } => "reset_clock",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_output_rejects_non_finite() {
        assert!(RigCommand::set_output("MFC1", f64::NAN).is_err());
        assert!(RigCommand::set_output("MFC1", f64::INFINITY).is_err());
        assert!(RigCommand::set_output("", 1.0).is_err());
        assert!(RigCommand::set_output("MFC1", 42.0).is_ok());
    }

    #[test]
    fn test_track_steps_validates_breakpoints() {
        assert!(RigCommand::track_steps(vec![0.0, 60.0], vec![1.0]).is_err());
        assert!(RigCommand::track_steps(vec![60.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(RigCommand::track_steps(vec![0.0, 60.0], vec![1.0, 2.0]).is_ok());
    }

    #[test]
    fn test_enqueue_never_blocks() {
        let (tx, mut rx) = command_channel();
        for i in 0..10_000 {
            let (cmd, _rx) = RigCommand::set_output("MFC1", i as f64).unwrap();
            tx.send(cmd).unwrap();
        }

        // FIFO order is preserved.
        let mut last = -1.0;
        while let Ok(cmd) = rx.try_recv() {
            if let RigCommand::SetOutput { value, .. } = cmd {
                assert!(value > last);
                last = value;
            }
        }
        assert_eq!(last, 9999.0);
    }

    #[test]
    fn test_targets() {
        let (cmd, _rx) = RigCommand::connect("SHT1", "0x54").unwrap();
        assert_eq!(cmd.target(), Some("SHT1"));

        let (cmd, _rx) = RigCommand::stop_recording();
        assert_eq!(cmd.target(), None);
        assert_eq!(cmd.operation(), "stop_recording");
    }
}
