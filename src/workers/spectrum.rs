//! Turns captures into spectra.
//!
//! Each pass takes the oldest pending captures, estimates their power
//! spectral density, subtracts the calibration when the capture carries one,
//! and adds the result to a rolling buffer per tuning. Calibrated and raw
//! estimates never share a buffer. The buffer's sum is what gets written
//! out, as a `.spec` file and a `.png` plot, with the capture's descriptor
//! copied last so the transmit worker only ever sees complete sets.
//!
//! Inputs are deleted once analysed, and also when they cannot be analysed
//! at all. If only writing the output failed, the partial output is removed
//! and the inputs stay for the next pass.

use crate::capture_file::{self, CaptureDir, CaptureFileError};
use crate::error::AgentError;
use crate::fixed_buffer::FixedBuffer;
use crate::model::Observation;
use crate::plot;
use crate::spectrum::{Baseline, LengthMismatch, Psd, Spectrum};
use crate::spectrum_file::{SpectrumFile, SpectrumFileError};
use crate::status::{StatusChannel, StatusSender};
use crate::worker::Worker;

use log::{debug, error, info, warn};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Calibration baselines kept in memory.
const BASELINE_CACHE: usize = 16;

/// Why one capture could not be analysed.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The capture set could not be read.
    #[error(transparent)]
    Capture(#[from] CaptureFileError),

    /// The capture and its calibration differ in length.
    #[error(transparent)]
    Mismatch(#[from] LengthMismatch),

    /// The analysis worked but its output could not be written.
    #[error("unable to write output: {0}")]
    Output(#[from] OutputError),
}

/// Failures writing one output set.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The `.spec` file.
    #[error(transparent)]
    SpectrumFile(#[from] SpectrumFileError),

    /// The `.png` plot.
    #[error("plot error: {0}")]
    Plot(#[from] image::ImageError),

    /// The `.json` descriptor.
    #[error(transparent)]
    Descriptor(#[from] CaptureFileError),
}

/// Where a finished capture was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumOutput {
    /// The `.spec` file.
    pub spectrum: PathBuf,
    /// The `.png` plot.
    pub plot: PathBuf,
    /// The `.json` descriptor, written last.
    pub descriptor: PathBuf,
}

/// Buffers are kept per tuning and per calibrated-ness.
type BufferKey = (u64, u64, bool);

/// Analyses captures waiting in the capture directory.
pub struct SpectrumWorker {
    input: CaptureDir,
    output: CaptureDir,
    batch_size: usize,
    buffer_length: usize,
    interval: Duration,
    status: StatusSender,
    psd: Psd,
    buffers: HashMap<BufferKey, FixedBuffer<Vec<f32>>>,
    baselines: LruCache<String, Baseline>,
}

impl SpectrumWorker {
    /// Reads captures from `input` and writes spectra to `output`.
    pub fn new(
        input: CaptureDir,
        output: CaptureDir,
        batch_size: usize,
        buffer_length: usize,
        interval: Duration,
        status: StatusSender,
    ) -> Self {
        Self {
            input,
            output,
            batch_size: batch_size.max(1),
            buffer_length,
            interval,
            status,
            psd: Psd::default(),
            buffers: HashMap::new(),
            baselines: LruCache::new(
                NonZeroUsize::new(BASELINE_CACHE).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Handles one batch. Returns how many captures produced output.
    pub fn pass(&mut self) -> Result<usize, AgentError> {
        let pending = self.input.pending(self.batch_size)?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!("[Spectrum] {} captures pending", pending.len());

        let mut written = 0;
        for descriptor in pending {
            let Some(identifier) = identifier_of(&descriptor) else {
                continue;
            };
            match self.process(&descriptor) {
                Ok(output) => {
                    info!("[Spectrum] wrote {}", output.spectrum.display());
                    written += 1;
                }
                Err(AnalysisError::Output(e)) => {
                    error!("[Spectrum] keeping {identifier} for the next pass: {e}");
                    self.status.flash_error(StatusChannel::Analysis);
                    continue;
                }
                Err(AnalysisError::Mismatch(e)) => {
                    warn!("[Spectrum] discarding {identifier}: {e}");
                    self.status.flash_error(StatusChannel::Analysis);
                }
                Err(e) => {
                    error!("[Spectrum] unable to analyse {identifier}: {e}");
                    self.status.flash_error(StatusChannel::Analysis);
                }
            }
            if let Err(e) = self.input.remove(&identifier) {
                warn!("[Spectrum] unable to remove inputs of {identifier}: {e}");
            }
        }
        Ok(written)
    }

    /// Analyses the capture described at `descriptor`. Leaves the inputs in
    /// place. The estimate only joins its buffer once the output is on disk.
    pub fn process(&mut self, descriptor: &Path) -> Result<SpectrumOutput, AnalysisError> {
        let _light = self.status.managed(StatusChannel::Analysis);
        let observation = capture_file::read_descriptor(descriptor)?;
        let id = observation.identifier.clone();

        let signal = capture_file::read_signal(&self.input.signal_path(&id))?;
        let estimate = self.psd.estimate(
            &signal,
            observation.sample_rate as f64,
            observation.frequency as f64,
        );
        let spectrum = match &observation.calibration {
            Some(calibration) => {
                let baseline = self.baseline(&id, calibration)?;
                estimate.calibrated(signal.len(), baseline)?
            }
            None => estimate,
        };

        let key = (
            observation.frequency,
            observation.sample_rate,
            observation.calibration.is_some(),
        );
        let mut buffer = self
            .buffers
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FixedBuffer::new(self.buffer_length));
        buffer.insert(spectrum.power);
        let summed = Spectrum {
            frequencies: spectrum.frequencies,
            power: buffer.sum(),
        };

        let output = self.write(&observation, &summed, buffer.percent_full())?;
        self.buffers.insert(key, buffer);
        Ok(output)
    }

    fn baseline(&mut self, id: &str, calibration: &Observation) -> Result<&Baseline, AnalysisError> {
        let path = self.input.calibration_path(id);
        let psd = &self.psd;
        self.baselines
            .try_get_or_insert(calibration.identifier.clone(), || {
                debug!("[Spectrum] computing baseline for {}", calibration.identifier);
                let signal = capture_file::read_signal(&path)?;
                Ok(psd.baseline(
                    &signal,
                    calibration.sample_rate as f64,
                    calibration.frequency as f64,
                ))
            })
    }

    /// Writes the set, descriptor last. On failure nothing of it is left.
    fn write(
        &self,
        observation: &Observation,
        spectrum: &Spectrum,
        percent_full: f32,
    ) -> Result<SpectrumOutput, OutputError> {
        let id = &observation.identifier;
        let root = self.output.root();
        let output = SpectrumOutput {
            spectrum: root.join(format!("{id}.spec")),
            plot: root.join(format!("{id}.png")),
            descriptor: self.output.descriptor_path(id),
        };

        if let Err(e) = write_set(observation, spectrum, percent_full, &output) {
            let tmp = output.descriptor.with_extension("json.tmp");
            for path in [&output.spectrum, &output.plot, &output.descriptor, &tmp] {
                if let Err(e) = capture_file::remove_if_exists(path) {
                    warn!("[Spectrum] unable to remove partial {}: {e}", path.display());
                }
            }
            return Err(e);
        }
        Ok(output)
    }
}

fn write_set(
    observation: &Observation,
    spectrum: &Spectrum,
    percent_full: f32,
    output: &SpectrumOutput,
) -> Result<(), OutputError> {
    SpectrumFile::builder(observation.identifier.as_str())
        .tuning(observation.frequency, observation.sample_rate)
        .calibrated(observation.calibration.is_some())
        .percent_full(percent_full)
        .spectrum(spectrum)
        .build()?
        .to_path(&output.spectrum)?;
    plot::write_png(spectrum, &output.plot)?;
    capture_file::write_descriptor(&output.descriptor, observation)?;
    Ok(())
}

fn identifier_of(descriptor: &Path) -> Option<String> {
    descriptor
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

impl Worker for SpectrumWorker {
    fn name(&self) -> &'static str {
        "Spectrum"
    }

    fn run(&mut self) -> Result<(), AgentError> {
        info!(
            "[Spectrum] analysing {} into {}",
            self.input.root().display(),
            self.output.root().display()
        );
        loop {
            if let Err(e) = self.pass() {
                error!("[Spectrum] pass failed: {e}");
            }
            thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaptureParams;
    use crate::status::status_channel;
    use chrono::Utc;
    use rustfft::num_complex::Complex;

    fn params(sample_size: u64) -> CaptureParams {
        CaptureParams {
            frequency: 100_000_000,
            sample_rate: 1_024_000,
            sample_size,
            gain: 10.0,
            ppm: 0,
            bandwidth: 1_000_000,
        }
    }

    fn tone(n: usize, amplitude: f32) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| Complex::from_polar(amplitude, 0.3 * i as f32))
            .collect()
    }

    struct Rig {
        _dir: tempfile::TempDir,
        capture: CaptureDir,
        calibration: CaptureDir,
        output: CaptureDir,
        worker: SpectrumWorker,
    }

    fn rig(buffer_length: usize) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let capture = CaptureDir::open(dir.path().join("capture")).unwrap();
        let calibration = CaptureDir::open(dir.path().join("calibration")).unwrap();
        let output = CaptureDir::open(dir.path().join("spectrum")).unwrap();
        let (status, _events) = status_channel();
        let worker = SpectrumWorker::new(
            capture.clone(),
            output.clone(),
            8,
            buffer_length,
            Duration::ZERO,
            status,
        );
        Rig {
            _dir: dir,
            capture,
            calibration,
            output,
            worker,
        }
    }

    /// Writes a calibration and an observation tagged with it.
    fn calibrated_capture(rig: &Rig, id: &str, signal: &[Complex<f32>], cal: &[Complex<f32>]) -> Observation {
        let now = Utc::now();
        let calibration = Observation::new(format!("cal-{id}"), &params(cal.len() as u64), now);
        rig.calibration.write(&calibration, cal, None).unwrap();
        let observation =
            Observation::new(id, &params(signal.len() as u64), now).with_calibration(&calibration);
        rig.capture
            .write(
                &observation,
                signal,
                Some(&rig.calibration.signal_path(&calibration.identifier)),
            )
            .unwrap();
        observation
    }

    #[test]
    fn calibrated_output_is_the_difference() {
        let mut rig = rig(1);
        let signal = tone(2048, 1.0);
        let cal = tone(2048, 0.25);
        calibrated_capture(&rig, "A-1", &signal, &cal);

        assert_eq!(rig.worker.pass().unwrap(), 1);

        let psd = Psd::default();
        let expected = psd
            .estimate(&signal, 1_024_000.0, 100e6)
            .calibrated(signal.len(), &psd.baseline(&cal, 1_024_000.0, 100e6))
            .unwrap();

        let written = SpectrumFile::from_path(rig.output.root().join("A-1.spec")).unwrap();
        assert!(written.header().calibrated);
        assert_eq!(written.bins().len(), expected.len());
        for ((_, got), want) in written.bins().iter().zip(&expected.power) {
            assert!((got - want).abs() <= want.abs() * 1e-4 + 1e-9);
        }
        assert!(rig.output.root().join("A-1.png").exists());
        assert_eq!(
            capture_file::read_descriptor(&rig.output.descriptor_path("A-1"))
                .unwrap()
                .identifier,
            "A-1"
        );

        // Inputs are gone, the calibration itself is untouched.
        assert!(rig.capture.pending(8).unwrap().is_empty());
        assert!(!rig.capture.calibration_path("A-1").exists());
        assert!(rig.calibration.signal_path("cal-A-1").exists());
    }

    #[test]
    fn length_mismatch_is_discarded() {
        let mut rig = rig(1);
        calibrated_capture(&rig, "B-1", &tone(2048, 1.0), &tone(1024, 0.5));

        assert_eq!(rig.worker.pass().unwrap(), 0);
        assert!(!rig.output.descriptor_path("B-1").exists());
        assert!(!rig.output.root().join("B-1.spec").exists());
        assert!(!rig.capture.descriptor_path("B-1").exists());
        assert!(!rig.capture.signal_path("B-1").exists());
    }

    #[test]
    fn buffer_sums_captures_at_the_same_tuning() {
        let mut rig = rig(4);
        let now = Utc::now();
        for id in ["C-1", "C-2"] {
            let observation = Observation::new(id, &params(1024), now);
            rig.capture.write(&observation, &tone(1024, 1.0), None).unwrap();
            rig.worker
                .process(&rig.capture.descriptor_path(id))
                .unwrap();
        }

        let first = SpectrumFile::from_path(rig.output.root().join("C-1.spec")).unwrap();
        let second = SpectrumFile::from_path(rig.output.root().join("C-2.spec")).unwrap();
        assert_eq!(first.header().percent_full, 0.25);
        assert_eq!(second.header().percent_full, 0.5);
        assert!(!second.header().calibrated);
        let (peak, _) = first
            .bins()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
            .unwrap();
        let ratio = second.bins()[peak].1 / first.bins()[peak].1;
        assert!((ratio - 2.0).abs() < 1e-3);
    }

    #[test]
    fn unreadable_capture_is_dropped() {
        let mut rig = rig(1);
        std::fs::write(rig.capture.descriptor_path("D-1"), b"{ nope").unwrap();
        assert_eq!(rig.worker.pass().unwrap(), 0);
        assert!(!rig.capture.descriptor_path("D-1").exists());
    }

    #[test]
    fn calibrated_and_raw_estimates_are_buffered_apart() {
        let mut rig = rig(4);
        calibrated_capture(&rig, "F-1", &tone(2048, 1.0), &tone(2048, 0.25));
        rig.capture
            .write(&Observation::new("F-2", &params(2048), Utc::now()), &tone(2048, 1.0), None)
            .unwrap();
        calibrated_capture(&rig, "F-3", &tone(2048, 1.0), &tone(2048, 0.25));
        assert_eq!(rig.worker.pass().unwrap(), 3);

        let header = |id: &str| {
            SpectrumFile::from_path(rig.output.root().join(format!("{id}.spec")))
                .unwrap()
                .header()
                .clone()
        };
        let (first, raw, third) = (header("F-1"), header("F-2"), header("F-3"));
        assert!(first.calibrated && third.calibrated);
        assert!(!raw.calibrated);
        assert_eq!(first.percent_full, 0.25);
        assert_eq!(raw.percent_full, 0.25);
        assert_eq!(third.percent_full, 0.5);
    }

    #[test]
    fn failed_output_keeps_the_inputs() {
        let mut rig = rig(4);
        let observation = Observation::new("G-1", &params(1024), Utc::now());
        rig.capture.write(&observation, &tone(1024, 1.0), None).unwrap();
        // A directory where the plot should go makes the write fail.
        let blocker = rig.output.root().join("G-1.png");
        std::fs::create_dir(&blocker).unwrap();

        assert_eq!(rig.worker.pass().unwrap(), 0);
        assert!(!rig.output.root().join("G-1.spec").exists());
        assert!(!rig.output.descriptor_path("G-1").exists());
        assert!(rig.capture.descriptor_path("G-1").exists());
        assert!(rig.capture.signal_path("G-1").exists());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(rig.worker.pass().unwrap(), 1);
        let written = SpectrumFile::from_path(rig.output.root().join("G-1.spec")).unwrap();
        // The failed attempt never reached the buffer.
        assert_eq!(written.header().percent_full, 0.25);
        assert!(rig.capture.pending(8).unwrap().is_empty());
    }
}
