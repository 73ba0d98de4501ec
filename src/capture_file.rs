//! Raw captures on disk.
//!
//! A capture directory holds, per identifier:
//!
//! - `<id>.wav`: the IQ signal as a two channel float WAV, I left and Q right,
//! - `<id>.cal.wav`: the calibration signal it should be corrected with,
//!   hard linked to the calibration capture so nothing is copied,
//! - `<id>.json`: the [`Observation`] descriptor.
//!
//! The descriptor is written last, through a rename, so a descriptor on disk
//! always means the rest of the set is complete.

use crate::model::Observation;
use crate::radio::Signal;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::debug;
use rustfft::num_complex::Complex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;

/// Errors reading or writing capture files.
#[derive(Debug, Error)]
pub enum CaptureFileError {
    /// A file could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The WAV codec failed.
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// The descriptor is not valid JSON.
    #[error("descriptor error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file is a WAV, but not one of ours.
    #[error("{path}: expected 2 float channels, found {channels}")]
    Layout {
        /// The offending file.
        path: PathBuf,
        /// Channels it has.
        channels: u16,
    },

    /// Listing pending captures failed.
    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Writes `signal` as a two channel float WAV.
pub fn write_signal(path: &Path, signal: &[Complex<f32>], sample_rate: u64) -> Result<(), CaptureFileError> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: u32::try_from(sample_rate).unwrap_or(u32::MAX),
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for sample in signal {
        writer.write_sample(sample.re)?;
        writer.write_sample(sample.im)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Reads a signal written by [`write_signal`].
pub fn read_signal(path: &Path) -> Result<Signal, CaptureFileError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 2 || spec.sample_format != SampleFormat::Float {
        return Err(CaptureFileError::Layout {
            path: path.to_owned(),
            channels: spec.channels,
        });
    }
    let interleaved = reader
        .samples::<f32>()
        .collect::<Result<Vec<f32>, hound::Error>>()?;
    Ok(interleaved
        .chunks_exact(2)
        .map(|iq| Complex::new(iq[0], iq[1]))
        .collect())
}

/// Parses an `<id>.json` descriptor.
pub fn read_descriptor(path: &Path) -> Result<Observation, CaptureFileError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Writes `observation` to `path` through a temporary file and a rename.
pub fn write_descriptor(path: &Path, observation: &Observation) -> Result<(), CaptureFileError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(observation)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// A directory of capture sets keyed by identifier.
#[derive(Debug, Clone)]
pub struct CaptureDir {
    root: PathBuf,
}

impl CaptureDir {
    /// Uses `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CaptureFileError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<id>.wav`
    pub fn signal_path(&self, identifier: &str) -> PathBuf {
        self.root.join(format!("{identifier}.wav"))
    }

    /// `<id>.cal.wav`
    pub fn calibration_path(&self, identifier: &str) -> PathBuf {
        self.root.join(format!("{identifier}.cal.wav"))
    }

    /// `<id>.json`
    pub fn descriptor_path(&self, identifier: &str) -> PathBuf {
        self.root.join(format!("{identifier}.json"))
    }

    /// Stores a capture. When `calibration_signal` is given it is linked in
    /// as `<id>.cal.wav`; the descriptor goes last.
    pub fn write(
        &self,
        observation: &Observation,
        signal: &[Complex<f32>],
        calibration_signal: Option<&Path>,
    ) -> Result<PathBuf, CaptureFileError> {
        let id = &observation.identifier;
        write_signal(&self.signal_path(id), signal, observation.sample_rate)?;

        if let Some(source) = calibration_signal {
            let target = self.calibration_path(id);
            remove_if_exists(&target)?;
            if let Err(e) = fs::hard_link(source, &target) {
                debug!("hard link to {} failed ({e}), copying", source.display());
                fs::copy(source, &target)?;
            }
        }

        let descriptor = self.descriptor_path(id);
        write_descriptor(&descriptor, observation)?;
        Ok(descriptor)
    }

    /// Descriptors waiting to be processed, oldest first, at most `limit`.
    pub fn pending(&self, limit: usize) -> Result<Vec<PathBuf>, CaptureFileError> {
        let pattern = self.root.join("*.json");
        let mut found: Vec<(SystemTime, PathBuf)> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();
        found.sort();
        Ok(found.into_iter().take(limit).map(|(_, path)| path).collect())
    }

    /// Deletes every file of the set.
    pub fn remove(&self, identifier: &str) -> io::Result<()> {
        remove_if_exists(&self.descriptor_path(identifier))?;
        remove_if_exists(&self.signal_path(identifier))?;
        remove_if_exists(&self.calibration_path(identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaptureParams;
    use chrono::{TimeZone, Utc};
    use std::{thread, time::Duration};

    fn params() -> CaptureParams {
        CaptureParams {
            frequency: 1_420_000_000,
            sample_rate: 2_048_000,
            sample_size: 4,
            gain: 10.0,
            ppm: 0,
            bandwidth: 1_000_000,
        }
    }

    fn signal() -> Vec<Complex<f32>> {
        vec![
            Complex::new(0.5, -0.5),
            Complex::new(1.0, 0.0),
            Complex::new(-0.25, 0.75),
            Complex::new(0.0, -1.0),
        ]
    }

    #[test]
    fn signal_keeps_i_and_q_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.wav");
        write_signal(&path, &signal(), 2_048_000).unwrap();

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(read_signal(&path).unwrap(), signal());
    }

    #[test]
    fn observation_with_calibration_links_the_calibration_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let cal_dir = CaptureDir::open(tmp.path().join("calibration")).unwrap();
        let obs_dir = CaptureDir::open(tmp.path().join("observations")).unwrap();
        let now = Utc.timestamp_opt(0, 0).unwrap();

        let calibration = Observation::new("cal", &params(), now);
        cal_dir.write(&calibration, &signal(), None).unwrap();

        let observation = Observation::new("obs", &params(), now).with_calibration(&calibration);
        let descriptor = obs_dir
            .write(&observation, &signal(), Some(&cal_dir.signal_path("cal")))
            .unwrap();

        // The link survives the calibration being replaced.
        cal_dir.remove("cal").unwrap();
        assert_eq!(
            read_signal(&obs_dir.calibration_path("obs")).unwrap(),
            signal()
        );
        assert_eq!(read_descriptor(&descriptor).unwrap(), observation);
        assert!(!obs_dir.root().join("obs.json.tmp").exists());
    }

    #[test]
    fn pending_is_oldest_first_and_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CaptureDir::open(tmp.path()).unwrap();
        let now = Utc.timestamp_opt(0, 0).unwrap();
        for id in ["b", "a", "c"] {
            dir.write(&Observation::new(id, &params(), now), &signal(), None)
                .unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        let pending = dir.pending(2).unwrap();
        assert_eq!(pending, vec![dir.descriptor_path("b"), dir.descriptor_path("a")]);

        dir.remove("b").unwrap();
        dir.remove("b").unwrap();
        assert_eq!(dir.pending(10).unwrap().len(), 2);
    }
}
