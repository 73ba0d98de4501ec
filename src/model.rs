//! Plain data shared between the workers: what the control plane tells us to
//! do ([`Task`], [`Telescope`]), how to tune the radio ([`CaptureParams`]),
//! and what a finished capture looks like on disk ([`Observation`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of this field station, replaced wholesale on every configure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telescope {
    pub id: i64,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

/// A scheduled capture window.
///
/// A task is active at `t` iff `start_at <= t <= end_at`, both ends inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Center frequency in Hz.
    pub frequency: u64,
    /// Samples per second.
    pub sample_rate: u64,
    /// Number of complex samples per capture.
    pub sample_size: u64,
    /// Frequency correction in parts per million.
    pub ppm: i32,
    /// Tuner gain, 0 to 100.
    pub gain: u8,
}

impl Task {
    /// Highest gain the control plane is allowed to ask for.
    pub const MAX_GAIN: u8 = 100;

    /// Checks the invariants the store relies on.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_empty() {
            return Err("task id is empty");
        }
        if self.start_at > self.end_at {
            return Err("task starts after it ends");
        }
        if self.gain > Self::MAX_GAIN {
            return Err("task gain is above 100");
        }
        if self.sample_rate == 0 {
            return Err("task sample rate is zero");
        }
        if self.sample_size == 0 {
            return Err("task sample size is zero");
        }
        Ok(())
    }

    /// Whether the window covers `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now <= self.end_at
    }

    /// Radio settings for one capture of this task.
    pub fn capture_params(&self, bandwidth: u64) -> CaptureParams {
        CaptureParams {
            frequency: self.frequency,
            sample_rate: self.sample_rate,
            sample_size: self.sample_size,
            gain: f32::from(self.gain),
            ppm: self.ppm,
            bandwidth,
        }
    }
}

/// The only part of a task a `delete-task` event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

/// Body of the remote task-list endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Configuration {
    pub telescope: Telescope,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Everything the radio needs to take one reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    pub frequency: u64,
    pub sample_rate: u64,
    pub sample_size: u64,
    pub gain: f32,
    pub ppm: i32,
    pub bandwidth: u64,
}

impl CaptureParams {
    /// The same tuning with a different sample count, used for warm-up and
    /// self-test reads.
    pub fn with_sample_size(self, sample_size: u64) -> Self {
        Self {
            sample_size,
            ..self
        }
    }

    /// Rough wall-clock time a real device needs for this read.
    pub fn estimated_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_size as f64 / self.sample_rate as f64
    }
}

/// Metadata describing one capture. Written next to the raw signal as the
/// `<identifier>.json` descriptor and handed from stage to stage with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub identifier: String,
    pub frequency: u64,
    pub sample_rate: u64,
    pub gain: f32,
    pub bandwidth: u64,
    pub timestamp: DateTime<Utc>,
    /// Metadata of the calibration this capture should be corrected with.
    /// Only the descriptor is nested here, never the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Box<Observation>>,
}

impl Observation {
    /// Describes a capture taken with `params` at `timestamp`.
    pub fn new(identifier: impl Into<String>, params: &CaptureParams, timestamp: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            frequency: params.frequency,
            sample_rate: params.sample_rate,
            gain: params.gain,
            bandwidth: params.bandwidth,
            timestamp,
            calibration: None,
        }
    }

    /// Attaches the metadata of a calibration capture. Any calibration nested
    /// inside the calibration itself is dropped.
    pub fn with_calibration(mut self, calibration: &Observation) -> Self {
        let mut nested = calibration.clone();
        nested.calibration = None;
        self.calibration = Some(Box::new(nested));
        self
    }
}

/// Builds a file-system friendly identifier such as
/// `sample-20240101T000000123456`. Anything in `prefix` other than ASCII
/// letters, digits, `-` and `_` becomes `_`, so a remote task id can never
/// name a path outside the capture directory.
pub fn identifier_for(prefix: &str, at: DateTime<Utc>) -> String {
    let prefix: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let prefix = if prefix.is_empty() { "sample" } else { &prefix };
    format!("{prefix}-{}", at.format("%Y%m%dT%H%M%S%6f"))
}
