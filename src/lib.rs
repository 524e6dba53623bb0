//! Core library for the hygrostat application.
//!
//! This library contains the polling scheduler, device abstractions, and
//! control strategies for a laboratory humidity-control rig. It is used
//! by the headless binary; the HTTP dashboard layer lives outside this
//! crate and talks to the rig through [`scheduler::SchedulerHandle`].

pub mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod pid;
pub mod program;
pub mod scheduler;
pub mod transport;
