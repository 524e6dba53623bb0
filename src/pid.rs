//! PID feedback controller for the humidity loop.
//!
//! Classic three-term controller with the behaviors the rig depends on:
//! output clamped to a configured range, integral term clamped to the
//! same range so it cannot wind up while an actuator saturates, and
//! derivative taken on the measurement so a setpoint jump does not kick
//! the output. Setpoint changes take effect on the next [`Pid::compute`]
//! call with no smoothing.
//!
//! The caller supplies `dt`; the scheduler drives the controller at its
//! tick period. An optional minimum interval gates faster calls.

/// Stateful PID controller.
#[derive(Clone, Debug)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    output_min: f64,
    output_max: f64,
    min_interval: Option<f64>,
    integral: f64,
    last_measurement: Option<f64>,
    last_output: f64,
    since_last: f64,
}

impl Pid {
    /// Controller with the given gains, clamped to `[0, 1]` by default.
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint: 0.0,
            output_min: 0.0,
            output_max: 1.0,
            min_interval: None,
            integral: 0.0,
            last_measurement: None,
            last_output: 0.0,
            since_last: 0.0,
        }
    }

    /// Sets the output clamp range.
    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        debug_assert!(min < max);
        self.output_min = min;
        self.output_max = max;
        self
    }

    /// Ignores compute calls arriving faster than `seconds` apart,
    /// returning the previous output instead.
    pub fn with_min_interval(mut self, seconds: f64) -> Self {
        self.min_interval = Some(seconds);
        self
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Reassigns the target. Effective on the next compute call.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Clamps a value to the configured output range.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.output_min, self.output_max)
    }

    /// Clears accumulated state. Called when a control mode is engaged so
    /// a stale integral from an earlier run cannot slew the actuators.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_measurement = None;
        self.last_output = self.clamp(0.0);
        self.since_last = 0.0;
    }

    /// One controller step: error against the live setpoint, integral and
    /// derivative update, output clamped to the configured range.
    pub fn compute(&mut self, measurement: f64, dt: f64) -> f64 {
        if let Some(min_interval) = self.min_interval {
            self.since_last += dt;
            if self.since_last < min_interval {
                return self.last_output;
            }
        }
        let dt = if self.min_interval.is_some() {
            std::mem::replace(&mut self.since_last, 0.0)
        } else {
            dt
        };

        let error = self.setpoint - measurement;

        let proportional = self.kp * error;

        if dt > 0.0 {
            self.integral = self.clamp(self.integral + self.ki * error * dt);
        }

        let derivative = match (self.last_measurement, dt > 0.0) {
            (Some(last), true) => -self.kd * (measurement - last) / dt,
            _ => 0.0,
        };
        self.last_measurement = Some(measurement);

        self.last_output = self.clamp(proportional + self.integral + derivative);
        self.last_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_always_within_limits() {
        let mut pid = Pid::new(100.0, 50.0, 10.0).with_output_limits(0.0, 1.0);
        pid.set_setpoint(50.0);

        for i in 0..100 {
            let measurement = (i as f64 - 50.0) * 1.0e6;
            let out = pid.compute(measurement, 0.1);
            assert!((0.0..=1.0).contains(&out), "out of range: {out}");
        }
    }

    #[test]
    fn test_clamp_is_idempotent() {
        let pid = Pid::new(1.0, 0.0, 0.0).with_output_limits(-10.0, 10.0);
        for x in [-1.0e9, -10.0, 0.0, 3.5, 10.0, 1.0e9] {
            assert_eq!(pid.clamp(pid.clamp(x)), pid.clamp(x));
        }
    }

    #[test]
    fn test_setpoint_change_effective_next_compute() {
        let mut pid = Pid::new(1.0, 0.0, 0.0).with_output_limits(-100.0, 100.0);
        pid.set_setpoint(10.0);
        assert_eq!(pid.compute(0.0, 0.1), 10.0);

        pid.set_setpoint(20.0);
        assert_eq!(pid.compute(0.0, 0.1), 20.0);
    }

    #[test]
    fn test_integral_accumulates_toward_target() {
        let mut pid = Pid::new(0.0, 1.0, 0.0).with_output_limits(0.0, 100.0);
        pid.set_setpoint(10.0);

        let first = pid.compute(0.0, 1.0);
        let second = pid.compute(0.0, 1.0);
        assert!(second > first);
    }

    #[test]
    fn test_integral_does_not_wind_up_past_limits() {
        let mut pid = Pid::new(0.0, 10.0, 0.0).with_output_limits(0.0, 1.0);
        pid.set_setpoint(100.0);
        for _ in 0..1000 {
            pid.compute(0.0, 0.1);
        }
        // After the error flips sign, the output must leave the rail
        // immediately rather than burning off an unbounded integral.
        pid.set_setpoint(-100.0);
        pid.compute(0.0, 0.1);
        let out = pid.compute(0.0, 0.1);
        assert!(out < 1.0);
    }

    #[test]
    fn test_min_interval_gates_fast_calls() {
        let mut pid = Pid::new(1.0, 0.0, 0.0)
            .with_output_limits(-100.0, 100.0)
            .with_min_interval(0.1);
        pid.set_setpoint(10.0);

        let first = pid.compute(0.0, 0.1);
        // 0.01 s later: gated, previous output returned.
        let gated = pid.compute(5.0, 0.01);
        assert_eq!(first, gated);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = Pid::new(1.0, 1.0, 1.0).with_output_limits(-100.0, 100.0);
        pid.set_setpoint(10.0);
        for _ in 0..5 {
            pid.compute(2.0, 0.1);
        }
        pid.reset();
        let mut fresh = Pid::new(1.0, 1.0, 1.0).with_output_limits(-100.0, 100.0);
        fresh.set_setpoint(10.0);
        assert_eq!(pid.compute(2.0, 0.1), fresh.compute(2.0, 0.1));
    }
}
