//! A radio that makes up its readings.
//!
//! Each read is a tone of random amplitude and phase at `tone_offset` Hz
//! from the center frequency, with uniform noise on top. Reads take half as
//! long as real hardware would, unless pacing is switched off (as the tests
//! do).

use crate::model::CaptureParams;
use crate::radio::{Radio, RadioError, Signal};

use rand::prelude::*;
use rustfft::num_complex::Complex;
use std::f32::consts::PI;
use std::time::Duration;

/// A [`Radio`] backed by a random number generator.
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    noise: f32,
    tone_offset: f32,
    healthy: bool,
    paced: bool,
}

/// Builder for [`SimulatedRadio`].
#[derive(Debug, Clone)]
pub struct SimulatedRadioBuilder {
    radio: SimulatedRadio,
}

impl SimulatedRadio {
    /// Starts from a healthy, paced radio with unit noise and a tone
    /// 100 kHz above center.
    pub fn builder() -> SimulatedRadioBuilder {
        SimulatedRadioBuilder {
            radio: SimulatedRadio {
                noise: 1.0,
                tone_offset: 100_000.0,
                healthy: true,
                paced: true,
            },
        }
    }

    fn generate(&self, params: &CaptureParams) -> Signal {
        let mut rng = thread_rng();
        let phase: f32 = rng.gen_range(0.0..(2.0 * PI));
        let amplitude: f32 = rng.gen_range(0.0..1.0);
        let step = if params.sample_rate == 0 {
            0.0
        } else {
            2.0 * PI * self.tone_offset / params.sample_rate as f32
        };

        (0..params.sample_size)
            .map(|n| {
                let tone = Complex::from_polar(amplitude, step * n as f32 + phase);
                let noise = if self.noise > 0.0 {
                    Complex::new(
                        rng.gen_range(-self.noise..self.noise),
                        rng.gen_range(-self.noise..self.noise),
                    )
                } else {
                    Complex::new(0.0, 0.0)
                };
                tone + noise
            })
            .collect()
    }
}

impl SimulatedRadioBuilder {
    /// Peak amplitude of the uniform noise added to each sample.
    pub fn noise(mut self, noise: f32) -> Self {
        self.radio.noise = noise.abs();
        self
    }

    /// Where the tone sits, in Hz from the center frequency.
    pub fn tone_offset(mut self, hz: f32) -> Self {
        self.radio.tone_offset = hz;
        self
    }

    /// An unhealthy radio fails its self-test and every read.
    pub fn healthy(mut self, healthy: bool) -> Self {
        self.radio.healthy = healthy;
        self
    }

    /// Whether reads sleep as if the samples came off real hardware.
    pub fn paced(mut self, paced: bool) -> Self {
        self.radio.paced = paced;
        self
    }

    /// Finishes the radio.
    pub fn build(self) -> SimulatedRadio {
        self.radio
    }
}

impl Radio for SimulatedRadio {
    fn name(&self) -> &str {
        "simulated"
    }

    fn test(&mut self) -> bool {
        self.healthy
    }

    fn read(&mut self, params: &CaptureParams) -> Result<Signal, RadioError> {
        if !self.healthy {
            return Err(RadioError::Simulated);
        }
        if self.paced {
            std::thread::sleep(Duration::from_secs_f64(params.estimated_seconds() / 2.0));
        }
        Ok(self.generate(params))
    }
}
