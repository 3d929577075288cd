//! Setpoint sequences.
//!
//! A plan is either a literal list cut at its first sentinel value, or a
//! ramp generated from start, end and step. Either way the sequence is fixed
//! once built.

use serde::Serialize;
use thiserror::Error;

use crate::config::PlanConfig;

/// Generated ramp values are rounded to millionths so float arithmetic does
/// not produce setpoints like 34.999999.
const RAMP_SCALE: f64 = 1e6;

/// Upper limit on the length of a generated ramp.
pub const MAX_RAMP_SETPOINTS: usize = 10_000;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("setpoint #{index} is not a finite temperature ({value})")]
    NonFinite { index: usize, value: f64 },

    #[error("ramp step must be greater than zero, got {0}")]
    InvalidStep(f64),

    #[error("setpoint {value} is outside the allowed range [{low}, {high}]")]
    OutOfBounds { value: f64, low: f64, high: f64 },

    #[error("ramp would produce more than {max} setpoints")]
    TooManySetpoints { max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetpointPlan {
    setpoints: Vec<f64>,
}

impl SetpointPlan {
    /// Take `values` up to, not including, the first entry equal to
    /// `sentinel`. A list without a sentinel is used in full.
    pub fn from_values(values: &[f64], sentinel: f64) -> Result<Self, PlanError> {
        let mut setpoints = Vec::with_capacity(values.len());
        for (index, &value) in values.iter().enumerate() {
            if value == sentinel {
                break;
            }
            if !value.is_finite() {
                return Err(PlanError::NonFinite { index, value });
            }
            setpoints.push(value);
        }
        Ok(Self { setpoints })
    }

    /// Evenly spaced setpoints from `start` toward `end`, inclusive of `end`
    /// when it falls on a step. Descends when `end < start`.
    pub fn ramp(start: f64, end: f64, step: f64) -> Result<Self, PlanError> {
        if !(step > 0.0) || !step.is_finite() {
            return Err(PlanError::InvalidStep(step));
        }
        for (index, value) in [start, end].into_iter().enumerate() {
            if !value.is_finite() {
                return Err(PlanError::NonFinite { index, value });
            }
        }

        let direction = if end < start { -1.0 } else { 1.0 };
        let span = ((end - start).abs() / step + 1.0 / RAMP_SCALE).floor();
        if span >= MAX_RAMP_SETPOINTS as f64 {
            return Err(PlanError::TooManySetpoints { max: MAX_RAMP_SETPOINTS });
        }
        let steps = span as usize;
        let setpoints = (0..=steps)
            .map(|i| {
                let raw = start + direction * step * i as f64;
                (raw * RAMP_SCALE).round() / RAMP_SCALE
            })
            .collect();
        Ok(Self { setpoints })
    }

    /// Build the plan described by the `[plan]` config section and check it
    /// against the configured bounds.
    pub fn from_config(config: &PlanConfig) -> Result<Self, PlanError> {
        let plan = match &config.ramp {
            Some(ramp) => Self::ramp(ramp.start, ramp.end, ramp.step)?,
            None => Self::from_values(&config.setpoints, config.sentinel)?,
        };
        plan.check_bounds(config.low_setpoint, config.high_setpoint)?;
        Ok(plan)
    }

    pub fn check_bounds(&self, low: f64, high: f64) -> Result<(), PlanError> {
        match self.setpoints.iter().find(|&&v| v < low || v > high) {
            Some(&value) => Err(PlanError::OutOfBounds { value, low, high }),
            None => Ok(()),
        }
    }

    pub fn setpoints(&self) -> &[f64] {
        &self.setpoints
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.setpoints.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.setpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setpoints.is_empty()
    }
}
