//! An RTL-SDR dongle driven through the `rtl_sdr` and `rtl_biast` command
//! line tools.
//!
//! `rtl_sdr` writes interleaved unsigned 8-bit I/Q bytes to a file. We point
//! it at a scratch file, wait for it to exit, and turn each byte pair into a
//! complex sample in `[-1, 1]`.

use crate::model::CaptureParams;
use crate::radio::{Radio, RadioError, Signal};

use log::{debug, warn};
use rustfft::num_complex::Complex;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

const CAPTURE_PROGRAM: &str = "rtl_sdr";
const BIAS_TEE_PROGRAM: &str = "rtl_biast";

/// Samples taken by [`Radio::test`].
const TEST_SAMPLES: u64 = 10;

/// A dongle reached through its command line tools.
#[derive(Debug, Clone)]
pub struct RtlSdr {
    device_index: u32,
    bias_tee: bool,
    work_dir: PathBuf,
}

impl RtlSdr {
    /// `work_dir` holds the scratch file for each read and is created on
    /// first use.
    pub fn new(device_index: u32, bias_tee: bool, work_dir: PathBuf) -> Self {
        Self {
            device_index,
            bias_tee,
            work_dir,
        }
    }

    fn run(&self, program: &str, args: &[String]) -> Result<(), RadioError> {
        debug!("running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RadioError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(RadioError::Exit {
                program: program.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }

    /// Switches the bias tee to the configured state. A failure here is not
    /// fatal; plenty of dongles have no bias tee at all.
    fn apply_bias_tee(&self) {
        let args = [
            "-d".to_owned(),
            self.device_index.to_string(),
            "-b".to_owned(),
            u8::from(self.bias_tee).to_string(),
        ];
        if let Err(e) = self.run(BIAS_TEE_PROGRAM, &args) {
            warn!("unable to set bias tee: {e}");
        }
    }

    fn capture_args(&self, params: &CaptureParams, destination: &str) -> Vec<String> {
        vec![
            "-f".to_owned(),
            params.frequency.to_string(),
            "-s".to_owned(),
            params.sample_rate.to_string(),
            "-d".to_owned(),
            self.device_index.to_string(),
            "-g".to_owned(),
            params.gain.to_string(),
            "-p".to_owned(),
            params.ppm.to_string(),
            "-S".to_owned(),
            "-n".to_owned(),
            params.sample_size.to_string(),
            destination.to_owned(),
        ]
    }
}

/// Turns interleaved u8 I/Q into complex samples. A dangling odd byte is
/// ignored.
pub fn decode_iq(bytes: &[u8]) -> Signal {
    bytes
        .chunks_exact(2)
        .map(|iq| {
            Complex::new(
                (f32::from(iq[0]) - 127.5) / 127.5,
                (f32::from(iq[1]) - 127.5) / 127.5,
            )
        })
        .collect()
}

impl Radio for RtlSdr {
    fn name(&self) -> &str {
        "rtl-sdr"
    }

    fn test(&mut self) -> bool {
        let params = CaptureParams {
            frequency: 100_000_000,
            sample_rate: 1_024_000,
            sample_size: TEST_SAMPLES,
            gain: 0.0,
            ppm: 0,
            bandwidth: 1_024_000,
        };
        match self.read(&params) {
            Ok(_) => true,
            Err(e) => {
                warn!("radio self-test failed: {e}");
                false
            }
        }
    }

    fn read(&mut self, params: &CaptureParams) -> Result<Signal, RadioError> {
        fs::create_dir_all(&self.work_dir)?;
        self.apply_bias_tee();

        let scratch = tempfile::Builder::new()
            .prefix("capture-")
            .suffix(".iq")
            .tempfile_in(&self.work_dir)?;
        let destination = scratch.path().to_string_lossy().into_owned();
        self.run(CAPTURE_PROGRAM, &self.capture_args(params, &destination))?;

        let mut signal = decode_iq(&fs::read(scratch.path())?);
        if (signal.len() as u64) < params.sample_size {
            return Err(RadioError::ShortRead {
                wanted: params.sample_size,
                got: signal.len() as u64,
            });
        }
        signal.truncate(params.sample_size as usize);
        Ok(signal)
    }
}
