//! In-process chamber model for dry runs.
//!
//! Each sample moves the air temperature toward the target by at most
//! `ramp_per_sample` while conditioning is on, then adds uniform noise.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SimulatedConfig;

use super::{ChamberController, ChamberError, ProcessReading};

pub struct SimulatedChamber {
    air: f64,
    target: f64,
    conditioning: bool,
    ramp_per_sample: f64,
    noise: f64,
    rng: StdRng,
}

impl SimulatedChamber {
    pub fn new(ambient: f64, ramp_per_sample: f64) -> Self {
        Self {
            air: ambient,
            target: ambient,
            conditioning: false,
            ramp_per_sample: ramp_per_sample.abs(),
            noise: 0.0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude.abs();
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn from_config(config: &SimulatedConfig) -> Self {
        Self::new(config.ambient, config.ramp_per_sample).with_noise(config.noise, config.seed)
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn is_conditioning(&self) -> bool {
        self.conditioning
    }
}

#[async_trait::async_trait]
impl ChamberController for SimulatedChamber {
    async fn set_target(&mut self, value: f64) -> Result<(), ChamberError> {
        self.target = value;
        Ok(())
    }

    async fn start_conditioning(&mut self) -> Result<(), ChamberError> {
        self.conditioning = true;
        Ok(())
    }

    async fn stop_conditioning(&mut self) -> Result<(), ChamberError> {
        self.conditioning = false;
        Ok(())
    }

    async fn sample(&mut self) -> Result<ProcessReading, ChamberError> {
        if self.conditioning && self.ramp_per_sample.is_finite() {
            let delta = (self.target - self.air).clamp(-self.ramp_per_sample, self.ramp_per_sample);
            self.air += delta;
        }
        let noise = if self.noise.is_finite() && self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        Ok(ProcessReading {
            air: self.air + noise,
        })
    }
}
