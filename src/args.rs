// Commandline and environment parser for the astronomer agent, using clap.
//
// Only the log level is meant for the command line; everything else comes
// from the environment of the service manager running the agent.

use crate::model::CaptureParams;
use crate::radio::RadioKind;
use crate::remote::Endpoints;
use crate::status::StatusChannel;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[clap(version, about = "Record signals from an RTL-SDR and transmit them to a remote service.")]
pub struct AgentArgs {
    /// Log filter, e.g. `info`, `debug`, or `warn,astronomer=debug`
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Identifier of this telescope on the control plane
    #[arg(long, env = "TELESCOPE_ID")]
    pub telescope_id: String,

    /// Device token sent as `Authorization: Device <token>`
    #[arg(long, env = "HOME_AUTHORIZATION_TOKEN", hide_env_values = true)]
    pub home_authorization_token: String,

    /// Base URL of the control plane
    #[arg(long, env = "HOME_URL", default_value = "https://starsweep.space")]
    pub home_url: String,

    /// SQLite file holding the telescope and its tasks
    #[arg(long, env = "DATABASE_LOCATION", default_value = "./db.sqlite")]
    pub database_location: PathBuf,

    /// Calibration center frequency, in Hz
    #[arg(long, env = "CAPTURE_FREQUENCY", default_value_t = 1_420_200_000)]
    pub capture_frequency: u64,

    /// Calibration sample rate, in samples per second
    #[arg(long, env = "CAPTURE_SAMPLE_RATE", default_value_t = 3_200_000)]
    pub capture_sample_rate: u64,

    /// Samples per calibration capture
    #[arg(long, env = "CAPTURE_SAMPLE_SIZE", default_value_t = 1_048_576)]
    pub capture_sample_size: u64,

    /// Calibration tuner gain
    #[arg(long, env = "CAPTURE_GAIN", default_value_t = 49.6)]
    pub capture_gain: f32,

    /// Frequency correction, in parts per million
    #[arg(long, env = "CAPTURE_PPM", default_value_t = 0, allow_negative_numbers = true)]
    pub capture_ppm: i32,

    /// Recorded bandwidth, in Hz
    #[arg(long, env = "CAPTURE_BANDWIDTH", default_value_t = 1_000_000)]
    pub capture_bandwidth: u64,

    /// Samples read and thrown away after power-up; defaults to the capture sample size
    #[arg(long, env = "WARM_UP_SAMPLES")]
    pub warm_up_samples: Option<u64>,

    /// Raw observations waiting for analysis
    #[arg(long, env = "CAPTURE_DATA_PATH", default_value = "./data/observations")]
    pub capture_data_path: PathBuf,

    /// Calibration captures
    #[arg(long, env = "CALIBRATION_DATA_PATH", default_value = "./data/calibration")]
    pub calibration_data_path: PathBuf,

    /// Finished spectra waiting for upload
    #[arg(long, env = "SPECTRUM_DATA_PATH", default_value = "./data/spectra")]
    pub spectrum_data_path: PathBuf,

    /// Seconds between downlink reconnect attempts
    #[arg(long, env = "DOWNLINK_RECONNECT_SECONDS", default_value_t = 10)]
    pub downlink_reconnect_seconds: u64,

    /// Seconds before an ordinary request gives up
    #[arg(long, env = "DEFAULT_REQUEST_TIMEOUT", default_value_t = 10)]
    pub default_request_timeout: u64,

    /// Seconds the event stream may stay silent before it counts as dropped
    #[arg(long, env = "DOWNLINK_EVENT_STREAM_TIMEOUT", default_value_t = 30)]
    pub downlink_event_stream_timeout: u64,

    /// Spectra uploaded per transmit pass
    #[arg(long, env = "TRANSMIT_BATCH_SIZE", default_value_t = 50)]
    pub transmit_batch_size: usize,

    /// Observations analysed per spectrum pass
    #[arg(long, env = "SPECTRUM_BATCH_SIZE", default_value_t = 10)]
    pub spectrum_batch_size: usize,

    /// Spectra summed into each output
    #[arg(long, env = "SIGNAL_BUFFER_LENGTH", default_value_t = 50)]
    pub signal_buffer_length: usize,

    /// Use the simulated radio instead of an RTL-SDR
    #[arg(long, env = "CAPTURE_TEST_MODE", default_value_t = false, action = clap::ArgAction::Set)]
    pub capture_test_mode: bool,

    /// Power the antenna LNA through the bias tee
    #[arg(long, env = "CAPTURE_BIAS_TEE", default_value_t = false, action = clap::ArgAction::Set)]
    pub capture_bias_tee: bool,

    /// Which RTL-SDR to use when several are plugged in
    #[arg(long, env = "CAPTURE_DEVICE_INDEX", default_value_t = 0)]
    pub capture_device_index: u32,

    #[arg(long, env = "CAPTURE_STATUS_PIN", default_value_t = 25)]
    pub capture_status_pin: u8,

    #[arg(long, env = "CALIBRATE_STATUS_PIN", default_value_t = 24)]
    pub calibrate_status_pin: u8,

    #[arg(long, env = "TRANSMIT_STATUS_PIN", default_value_t = 23)]
    pub transmit_status_pin: u8,

    #[arg(long, env = "DOWNLINK_STATUS_PIN", default_value_t = 11)]
    pub downlink_status_pin: u8,

    #[arg(long, env = "SPECTRUM_STATUS_PIN", default_value_t = 26)]
    pub spectrum_status_pin: u8,

    /// Test panel mirroring the status lights
    #[arg(long, env = "INDICATOR_PANEL_ADDR")]
    pub indicator_panel_addr: Option<SocketAddr>,

    /// Where to listen for `calibrate` / `observe` button presses
    #[arg(long, env = "INPUT_LISTEN_ADDR")]
    pub input_listen_addr: Option<SocketAddr>,

    #[arg(long, env = "LOG_FILE", default_value = "astronomer.log")]
    pub log_file: PathBuf,

    /// Period of the capture loop, in milliseconds
    #[arg(long, env = "CAPTURE_INTERVAL_MS", default_value_t = 300)]
    pub capture_interval_ms: u64,

    /// Period of the spectrum loop, in milliseconds
    #[arg(long, env = "PROCESSING_INTERVAL_MS", default_value_t = 1000)]
    pub processing_interval_ms: u64,

    /// Period of background retries (health checks, transmit passes), in seconds
    #[arg(long, env = "BACKGROUND_INTERVAL_SECONDS", default_value_t = 10)]
    pub background_interval_seconds: u64,

    /// Longest pause between two uploads, in seconds
    #[arg(long, env = "TRANSMIT_MAX_JITTER_SECONDS", default_value_t = 10)]
    pub transmit_max_jitter_seconds: u64,

    #[arg(long, env = "CALIBRATE_ON_START", default_value_t = true, action = clap::ArgAction::Set)]
    pub calibrate_on_start: bool,

    #[arg(long, env = "OBSERVE_ON_START", default_value_t = true, action = clap::ArgAction::Set)]
    pub observe_on_start: bool,
}

/// Radio settings used for calibration and warm-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub frequency: u64,
    pub sample_rate: u64,
    pub sample_size: u64,
    pub gain: f32,
    pub ppm: i32,
    pub bandwidth: u64,
    pub warm_up_samples: u64,
}

impl CaptureSettings {
    /// Tuning for calibration reads.
    pub fn params(&self) -> CaptureParams {
        CaptureParams {
            frequency: self.frequency,
            sample_rate: self.sample_rate,
            sample_size: self.sample_size,
            gain: self.gain,
            ppm: self.ppm,
            bandwidth: self.bandwidth,
        }
    }
}

/// Pin for each status light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPins {
    pub capture: u8,
    pub calibrate: u8,
    pub transmit: u8,
    pub downlink: u8,
    pub analysis: u8,
}

impl StatusPins {
    /// GPIO number of the light for `channel`.
    pub fn pin_for(&self, channel: StatusChannel) -> u8 {
        match channel {
            StatusChannel::Capture => self.capture,
            StatusChannel::Calibrate => self.calibrate,
            StatusChannel::Transmit => self.transmit,
            StatusChannel::Downlink => self.downlink,
            StatusChannel::Analysis => self.analysis,
        }
    }
}

/// Everything the agent is configured with, resolved once at start-up.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,
    pub telescope_id: String,
    pub token: String,
    pub endpoints: Endpoints,
    pub database: PathBuf,
    pub capture: CaptureSettings,
    pub radio: RadioKind,
    pub capture_dir: PathBuf,
    pub calibration_dir: PathBuf,
    pub spectrum_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub transmit_batch_size: usize,
    pub spectrum_batch_size: usize,
    pub buffer_length: usize,
    pub pins: StatusPins,
    pub indicator_panel: Option<SocketAddr>,
    pub input_listen: Option<SocketAddr>,
    pub log_file: PathBuf,
    pub capture_interval: Duration,
    pub processing_interval: Duration,
    pub background_interval: Duration,
    pub transmit_max_jitter: Duration,
    pub calibrate_on_start: bool,
    pub observe_on_start: bool,
}

impl AgentArgs {
    /// Resolves the parsed arguments into [`Settings`].
    pub fn settings(&self) -> Settings {
        let capture = CaptureSettings {
            frequency: self.capture_frequency,
            sample_rate: self.capture_sample_rate,
            sample_size: self.capture_sample_size,
            gain: self.capture_gain,
            ppm: self.capture_ppm,
            bandwidth: self.capture_bandwidth,
            warm_up_samples: self.warm_up_samples.unwrap_or(self.capture_sample_size),
        };
        let radio = if self.capture_test_mode {
            RadioKind::Simulated
        } else {
            RadioKind::RtlSdr {
                device_index: self.capture_device_index,
                bias_tee: self.capture_bias_tee,
                work_dir: self.capture_data_path.join(".raw"),
            }
        };

        Settings {
            log_level: self.log_level.clone(),
            telescope_id: self.telescope_id.clone(),
            token: self.home_authorization_token.clone(),
            endpoints: Endpoints::new(&self.home_url, &self.telescope_id),
            database: self.database_location.clone(),
            capture,
            radio,
            capture_dir: self.capture_data_path.clone(),
            calibration_dir: self.calibration_data_path.clone(),
            spectrum_dir: self.spectrum_data_path.clone(),
            reconnect_delay: Duration::from_secs(self.downlink_reconnect_seconds),
            request_timeout: Duration::from_secs(self.default_request_timeout),
            stream_timeout: Duration::from_secs(self.downlink_event_stream_timeout),
            transmit_batch_size: self.transmit_batch_size,
            spectrum_batch_size: self.spectrum_batch_size,
            buffer_length: self.signal_buffer_length,
            pins: StatusPins {
                capture: self.capture_status_pin,
                calibrate: self.calibrate_status_pin,
                transmit: self.transmit_status_pin,
                downlink: self.downlink_status_pin,
                analysis: self.spectrum_status_pin,
            },
            indicator_panel: self.indicator_panel_addr,
            input_listen: self.input_listen_addr,
            log_file: self.log_file.clone(),
            capture_interval: Duration::from_millis(self.capture_interval_ms),
            processing_interval: Duration::from_millis(self.processing_interval_ms),
            background_interval: Duration::from_secs(self.background_interval_seconds),
            transmit_max_jitter: Duration::from_secs(self.transmit_max_jitter_seconds),
            calibrate_on_start: self.calibrate_on_start,
            observe_on_start: self.observe_on_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> AgentArgs {
        let mut argv = vec![
            "astronomer",
            "--telescope-id",
            "7",
            "--home-authorization-token",
            "secret",
        ];
        argv.extend_from_slice(extra);
        AgentArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_resolve_to_settings() {
        let settings = parse(&[]).settings();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.capture.frequency, 1_420_200_000);
        assert_eq!(settings.capture.warm_up_samples, 1_048_576);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(10));
        assert_eq!(settings.capture_interval, Duration::from_millis(300));
        assert_eq!(settings.pins.pin_for(StatusChannel::Analysis), 26);
        assert_eq!(
            settings.endpoints.events,
            "https://starsweep.space/api/events/TEL-7"
        );
        assert!(matches!(settings.radio, RadioKind::RtlSdr { device_index: 0, .. }));
        assert!(settings.calibrate_on_start && settings.observe_on_start);
    }

    #[test]
    fn test_mode_selects_the_simulated_radio() {
        let settings = parse(&[
            "-l",
            "debug",
            "--capture-test-mode",
            "true",
            "--capture-ppm",
            "-2",
            "--observe-on-start",
            "false",
        ])
        .settings();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.radio, RadioKind::Simulated);
        assert_eq!(settings.capture.ppm, -2);
        assert!(!settings.observe_on_start);
    }
}
