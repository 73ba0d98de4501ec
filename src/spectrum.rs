//! Power spectral density estimates.
//!
//! Welch's method with no overlap: the signal is cut into `nfft` long
//! segments, each is Hann windowed and transformed, and the squared
//! magnitudes are averaged and scaled to a density, `|X|^2 / (Fs * sum(w^2))`.
//! A signal shorter than one segment is zero padded. The result is two-sided
//! and shifted so frequencies run from `Fc - Fs/2` upwards.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::{f32::consts::PI, fmt, sync::Arc};

/// Segment length used throughout the agent.
pub const NFFT: usize = 1024;

/// A power spectrum on an absolute frequency axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Bin centers in Hz.
    pub frequencies: Vec<f64>,
    /// Power per bin, linear.
    pub power: Vec<f32>,
}

impl Spectrum {
    /// Number of bins.
    pub fn len(&self) -> usize {
        self.power.len()
    }

    /// Whether there are no bins.
    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    /// Subtracts a calibration estimate, bin by bin. `samples` is the length
    /// of the signal this spectrum was estimated from; it has to match the
    /// calibration's.
    pub fn calibrated(&self, samples: usize, baseline: &Baseline) -> Result<Spectrum, LengthMismatch> {
        if samples != baseline.samples {
            return Err(LengthMismatch {
                signal: samples,
                calibration: baseline.samples,
            });
        }
        Ok(Spectrum {
            frequencies: self.frequencies.clone(),
            power: self
                .power
                .iter()
                .zip(&baseline.power)
                .map(|(p, c)| p - c)
                .collect(),
        })
    }
}

/// The estimate of a calibration capture, kept around so it is only computed
/// once per calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    /// Number of samples in the calibration signal.
    pub samples: usize,
    /// Power per bin, in fftshift order.
    pub power: Vec<f32>,
}

/// A signal and its calibration do not have the same number of samples, so
/// their estimates cannot be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthMismatch {
    /// Samples in the signal.
    pub signal: usize,
    /// Samples in the calibration.
    pub calibration: usize,
}

impl fmt::Display for LengthMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signal has {} samples but its calibration has {}",
            self.signal, self.calibration
        )
    }
}

impl std::error::Error for LengthMismatch {}

/// A planned estimator for one segment length.
pub struct Psd {
    nfft: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_power: f32,
}

impl fmt::Debug for Psd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Psd").field("nfft", &self.nfft).finish()
    }
}

impl Default for Psd {
    fn default() -> Self {
        Self::new(NFFT)
    }
}

/// Symmetric Hann window of length `n`.
fn hann(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

impl Psd {
    /// Plans an FFT of `nfft` points. A length of zero is treated as one.
    pub fn new(nfft: usize) -> Self {
        let nfft = nfft.max(1);
        let fft = FftPlanner::new().plan_fft_forward(nfft);
        let window = hann(nfft);
        let window_power: f32 = window.iter().map(|w| w * w).sum();
        Self {
            nfft,
            fft,
            window,
            window_power,
        }
    }

    /// Segment length of the estimate.
    pub fn nfft(&self) -> usize {
        self.nfft
    }

    /// Estimates the density of `signal`, sampled at `sample_rate` around
    /// `center_frequency`.
    pub fn estimate(&self, signal: &[Complex<f32>], sample_rate: f64, center_frequency: f64) -> Spectrum {
        let n = self.nfft;
        let padded;
        let signal = if signal.len() < n {
            let mut p = signal.to_vec();
            p.resize(n, Complex::new(0.0, 0.0));
            padded = p;
            &padded[..]
        } else {
            signal
        };

        let mut total = vec![0.0f32; n];
        let mut buffer = vec![Complex::new(0.0, 0.0); n];
        let mut segments = 0usize;
        for segment in signal.chunks_exact(n) {
            for ((b, s), w) in buffer.iter_mut().zip(segment).zip(&self.window) {
                *b = *s * *w;
            }
            self.fft.process(&mut buffer);
            for (t, b) in total.iter_mut().zip(&buffer) {
                *t += b.norm_sqr();
            }
            segments += 1;
        }

        let scale = if sample_rate > 0.0 && self.window_power > 0.0 {
            1.0 / (sample_rate as f32 * self.window_power * segments as f32)
        } else {
            0.0
        };
        let half = n / 2;
        let step = sample_rate / n as f64;

        Spectrum {
            frequencies: (0..n)
                .map(|k| center_frequency + (k as f64 - half as f64) * step)
                .collect(),
            power: (0..n).map(|k| total[(k + half) % n] * scale).collect(),
        }
    }

    /// Estimates a calibration capture.
    pub fn baseline(&self, calibration: &[Complex<f32>], sample_rate: f64, center_frequency: f64) -> Baseline {
        Baseline {
            samples: calibration.len(),
            power: self.estimate(calibration, sample_rate, center_frequency).power,
        }
    }
}
