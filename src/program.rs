//! Time-indexed setpoint programs for the control strategies.
//!
//! A [`SetpointProgram`] maps seconds-since-program-start to a target
//! value. Three shapes cover the rig's use cases:
//!
//! - **Constant**: one value forever.
//! - **Steps**: piecewise-constant over ascending breakpoints. Lookup is
//!   the greatest breakpoint at or before the query time, clamped to the
//!   first value before the first breakpoint; the last value holds for
//!   all later times.
//! - **Sampled**: a dense time/value table built by evaluating
//!   `(expression, duration)` segments at a fixed rate. Querying past the
//!   last sample is a [`RigError::ProgramRange`] error, never a silent
//!   extrapolation.
//!
//! Expression evaluation is an external concern behind the
//! [`ExpressionSampler`] contract; [`RhaiSampler`] implements it with the
//! embedded `rhai` engine (the variable `t` is segment-local time).

use serde::Deserialize;

use crate::error::{RigError, RigResult};

/// Sampling rate for segment expressions, samples per second of segment
/// duration.
pub const SAMPLES_PER_SECOND: f64 = 60.0;

/// One `(expression, duration)` piece of an arbitrary program.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProgramSegment {
    /// Expression in the variable `t` (segment-local seconds)
    pub expression: String,
    /// Segment duration in seconds
    pub duration: f64,
}

impl ProgramSegment {
    pub fn new(expression: impl Into<String>, duration: f64) -> Self {
        Self {
            expression: expression.into(),
            duration,
        }
    }
}

/// Pure sampling contract: evaluate `expr` at each time in `times`.
///
/// The result is dense and finite, one value per query time, in order.
pub trait ExpressionSampler: Send + Sync {
    fn sample(&self, expr: &str, times: &[f64]) -> RigResult<Vec<f64>>;
}

/// [`ExpressionSampler`] backed by the embedded rhai engine.
pub struct RhaiSampler {
    engine: rhai::Engine,
}

impl RhaiSampler {
    pub fn new() -> Self {
        Self {
            engine: rhai::Engine::new(),
        }
    }
}

impl Default for RhaiSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionSampler for RhaiSampler {
    fn sample(&self, expr: &str, times: &[f64]) -> RigResult<Vec<f64>> {
        let ast = self
            .engine
            .compile_expression(expr)
            .map_err(|e| RigError::Expression(format!("'{expr}': {e}")))?;

        times
            .iter()
            .map(|&t| {
                let mut scope = rhai::Scope::new();
                scope.push("t", t);
                let value = self
                    .engine
                    .eval_ast_with_scope::<rhai::Dynamic>(&mut scope, &ast)
                    .map_err(|e| RigError::Expression(format!("'{expr}' at t={t}: {e}")))?;
                dynamic_to_f64(&value)
                    .ok_or_else(|| RigError::Expression(format!("'{expr}' is not numeric")))
            })
            .collect()
    }
}

fn dynamic_to_f64(value: &rhai::Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        Some(f)
    } else {
        value.as_int().ok().map(|i| i as f64)
    }
}

/// Evenly spaced samples over `[0, stop]`, endpoints included.
fn linspace(stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| stop * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// A control target as a function of elapsed seconds.
#[derive(Clone, Debug, PartialEq)]
pub enum SetpointProgram {
    /// One value for all times
    Constant(f64),
    /// Piecewise-constant over ascending breakpoints
    Steps { times: Vec<f64>, values: Vec<f64> },
    /// Dense samples from expression segments
    Sampled { times: Vec<f64>, values: Vec<f64> },
}

impl SetpointProgram {
    pub fn constant(value: f64) -> RigResult<Self> {
        if !value.is_finite() {
            return Err(RigError::Validation(
                "constant setpoint must be finite".to_string(),
            ));
        }
        Ok(Self::Constant(value))
    }

    /// Builds a step program over ascending breakpoints.
    pub fn steps(times: Vec<f64>, values: Vec<f64>) -> RigResult<Self> {
        if times.is_empty() {
            return Err(RigError::Validation(
                "step program needs at least one breakpoint".to_string(),
            ));
        }
        if times.len() != values.len() {
            return Err(RigError::Validation(format!(
                "{} breakpoints but {} values",
                times.len(),
                values.len()
            )));
        }
        if times.iter().chain(values.iter()).any(|v| !v.is_finite()) {
            return Err(RigError::Validation(
                "breakpoints and values must be finite".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RigError::Validation(
                "breakpoints must be strictly ascending".to_string(),
            ));
        }
        Ok(Self::Steps { times, values })
    }

    /// Builds a sampled program from expression segments.
    ///
    /// Each segment is sampled over `[0, duration]` at
    /// [`SAMPLES_PER_SECOND`], its times shifted by the running cumulative
    /// duration, and appended. Segment boundaries are shared endpoints and
    /// are kept duplicated.
    pub fn from_segments(
        segments: &[ProgramSegment],
        sampler: &dyn ExpressionSampler,
    ) -> RigResult<Self> {
        if segments.is_empty() {
            return Err(RigError::Validation(
                "program needs at least one segment".to_string(),
            ));
        }

        let mut times = Vec::new();
        let mut values = Vec::new();
        let mut offset = 0.0;

        for segment in segments {
            if segment.expression.trim().is_empty() {
                return Err(RigError::Validation("empty segment expression".to_string()));
            }
            if !segment.duration.is_finite() || segment.duration < 0.0 {
                return Err(RigError::Validation(format!(
                    "segment duration {} is not a non-negative number",
                    segment.duration
                )));
            }

            let n = (segment.duration * SAMPLES_PER_SECOND) as usize;
            let local = linspace(segment.duration, n);
            let sampled = sampler.sample(&segment.expression, &local)?;

            if sampled.iter().any(|v| !v.is_finite()) {
                return Err(RigError::Expression(format!(
                    "'{}' produced a non-finite value",
                    segment.expression
                )));
            }

            times.extend(local.iter().map(|t| t + offset));
            values.extend(sampled);
            offset += segment.duration;
        }

        if times.is_empty() {
            return Err(RigError::Validation(
                "program sampled to zero points".to_string(),
            ));
        }

        Ok(Self::Sampled { times, values })
    }

    /// Target value at `t` seconds after program start.
    pub fn evaluate(&self, t: f64) -> RigResult<f64> {
        match self {
            Self::Constant(v) => Ok(*v),

            Self::Steps { times, values } => Ok(lookup_hold(times, values, t)),

            Self::Sampled { times, values } => {
                // Past the last sample there is no defined target.
                let horizon = *times.last().unwrap_or(&0.0);
                if t > horizon {
                    return Err(RigError::ProgramRange(t));
                }
                Ok(lookup_hold(times, values, t))
            }
        }
    }

    /// Last defined time, if the program has a finite horizon.
    pub fn horizon(&self) -> Option<f64> {
        match self {
            Self::Sampled { times, .. } => times.last().copied(),
            _ => None,
        }
    }
}

/// Greatest sample at or before `t`, clamped to the first value for
/// earlier times.
fn lookup_hold(times: &[f64], values: &[f64], t: f64) -> f64 {
    match times.partition_point(|&x| x <= t) {
        0 => values[0],
        i => values[i - 1],
    }
}
