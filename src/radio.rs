//! The capture capability.
//!
//! A [`Radio`] can prove it is alive ([`Radio::test`]) and take a reading of
//! `n` complex samples at a given tuning ([`Radio::read`]). Which variant the
//! agent uses is decided once, when it is built from [`RadioKind`]; nothing
//! else in the crate knows whether it is talking to hardware.

use crate::model::CaptureParams;
use crate::rtl_sdr::RtlSdr;
use crate::simulated_radio::SimulatedRadio;

use rustfft::num_complex::Complex;
use std::path::PathBuf;
use thiserror::Error;

/// A block of IQ samples.
pub type Signal = Vec<Complex<f32>>;

/// Things that go wrong while talking to a radio.
#[derive(Debug, Error)]
pub enum RadioError {
    /// Could not run the external capture program at all.
    #[error("unable to run `{program}`: {source}")]
    Spawn {
        /// The program that could not be started.
        program: String,
        /// Why it could not be started.
        source: std::io::Error,
    },

    /// The capture program ran and reported a failure.
    #[error("`{program}` exited with {status}: {stderr}")]
    Exit {
        /// The program that failed.
        program: String,
        /// How it exited.
        status: std::process::ExitStatus,
        /// What it printed on stderr.
        stderr: String,
    },

    /// The device returned fewer samples than asked for.
    #[error("short read: wanted {wanted} samples, got {got}")]
    ShortRead {
        /// Samples asked for.
        wanted: u64,
        /// Samples returned.
        got: u64,
    },

    /// The simulated device was told to fail.
    #[error("simulated device failure")]
    Simulated,

    /// Reading or cleaning up the capture file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `Radio`
///
/// Something that can take IQ readings. Implementations own whatever state
/// the device needs; callers only hand over the tuning for each read.
pub trait Radio: Send {
    /// A short human readable name, used in logs.
    fn name(&self) -> &str;

    /// Takes a tiny reading to check the device answers.
    fn test(&mut self) -> bool;

    /// Takes `params.sample_size` samples at the given tuning.
    fn read(&mut self, params: &CaptureParams) -> Result<Signal, RadioError>;
}

impl<R: Radio + ?Sized> Radio for Box<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn test(&mut self) -> bool {
        (**self).test()
    }

    fn read(&mut self, params: &CaptureParams) -> Result<Signal, RadioError> {
        (**self).read(params)
    }
}

/// Which radio to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioKind {
    /// Generated signals; no hardware needed.
    Simulated,
    /// An RTL-SDR driven through the `rtl_sdr` command line tools.
    RtlSdr {
        /// `-d` index of the dongle.
        device_index: u32,
        /// Power the LNA through the coax before each read.
        bias_tee: bool,
        /// Scratch directory for raw captures.
        work_dir: PathBuf,
    },
}

impl RadioKind {
    /// Builds the selected radio.
    pub fn build(self) -> Box<dyn Radio> {
        match self {
            RadioKind::Simulated => Box::new(SimulatedRadio::builder().build()),
            RadioKind::RtlSdr {
                device_index,
                bias_tee,
                work_dir,
            } => Box::new(RtlSdr::new(device_index, bias_tee, work_dir)),
        }
    }
}
