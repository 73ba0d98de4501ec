//! The capture loop.
//!
//! After one warm-up read that is thrown away, every tick checks the two
//! operator flags. A pending calibration request takes a reading at the
//! configured tuning into the calibration directory and makes it current.
//! While observing, each task whose window covers the tick gets one reading,
//! tagged with the current calibration so the spectrum worker can subtract
//! it. A failed read ends the worker.

use crate::args::CaptureSettings;
use crate::capture_file::CaptureDir;
use crate::error::AgentError;
use crate::model::{identifier_for, CaptureParams, Observation, Task};
use crate::radio::Radio;
use crate::status::{Flags, StatusChannel, StatusSender};
use crate::store::TaskStore;
use crate::worker::Worker;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Prefix of calibration identifiers.
pub const CALIBRATION_PREFIX: &str = "calibration";

/// Takes readings for active tasks.
pub struct WatchSky {
    radio: Box<dyn Radio>,
    store: TaskStore,
    observations: CaptureDir,
    calibrations: CaptureDir,
    flags: Flags,
    status: StatusSender,
    capture: CaptureSettings,
    interval: Duration,
    calibration: Option<Observation>,
}

impl WatchSky {
    #[allow(clippy::too_many_arguments)]
    /// Captures into `observations` and keeps calibrations in `calibrations`.
    pub fn new(
        radio: Box<dyn Radio>,
        store: TaskStore,
        observations: CaptureDir,
        calibrations: CaptureDir,
        flags: Flags,
        status: StatusSender,
        capture: CaptureSettings,
        interval: Duration,
    ) -> Self {
        Self {
            radio,
            store,
            observations,
            calibrations,
            flags,
            status,
            capture,
            interval,
            calibration: None,
        }
    }

    /// The calibration new observations are tagged with.
    pub fn calibration(&self) -> Option<&Observation> {
        self.calibration.as_ref()
    }

    /// One discarded read, so the tuner has settled before the first real
    /// capture.
    pub fn warm_up(&mut self) -> Result<(), AgentError> {
        let light = self.status.managed(StatusChannel::Capture);
        let params = self
            .capture
            .params()
            .with_sample_size(self.capture.warm_up_samples);
        info!("[Capture] warming up with {} samples", params.sample_size);
        if let Err(e) = self.radio.read(&params) {
            error!("[Capture] warm-up failed: {e}");
            light.error();
            return Err(e.into());
        }
        Ok(())
    }

    /// Runs one pass of the loop as of `now`. Returns how many observations
    /// were written.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<usize, AgentError> {
        if self.flags.should_calibrate() {
            // Cleared first so a request made during the reading is kept.
            self.flags.clear_calibration();
            let light = self.status.managed(StatusChannel::Calibrate);
            if let Err(e) = self.calibrate() {
                error!("[Calibrate] failed to take reading: {e}");
                self.flags.request_calibration();
                light.error();
                return Err(e);
            }
        }

        if !self.flags.should_observe() {
            return Ok(0);
        }
        let tasks = self.store.active_tasks(now)?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let light = self.status.managed(StatusChannel::Capture);
        for task in &tasks {
            if let Err(e) = self.observe(task) {
                error!("[Capture] failed to take reading for task {}: {e}", task.id);
                light.error();
                return Err(e);
            }
        }
        Ok(tasks.len())
    }

    fn calibrate(&mut self) -> Result<(), AgentError> {
        let params = self.capture.params();
        let now = Utc::now();
        let observation = Observation::new(identifier_for(CALIBRATION_PREFIX, now), &params, now);
        let signal = self.radio.read(&params)?;
        self.calibrations.write(&observation, &signal, None)?;
        info!("[Calibrate] new calibration {}", observation.identifier);

        let current = observation.identifier.clone();
        if let Some(previous) = self
            .calibration
            .replace(observation)
            .filter(|previous| previous.identifier != current)
        {
            // Observations already written hold their own link to it.
            if let Err(e) = self.calibrations.remove(&previous.identifier) {
                warn!(
                    "[Calibrate] unable to remove old calibration {}: {e}",
                    previous.identifier
                );
            }
        }
        Ok(())
    }

    fn observe(&mut self, task: &Task) -> Result<PathBuf, AgentError> {
        let params: CaptureParams = task.capture_params(self.capture.bandwidth);
        let now = Utc::now();
        let mut observation = Observation::new(identifier_for(&task.id, now), &params, now);
        debug!(
            "[Capture] task {}: {} samples at {} Hz",
            task.id, params.sample_size, params.frequency
        );
        let signal = self.radio.read(&params)?;

        let calibration_signal = match &self.calibration {
            Some(calibration) => {
                observation = observation.with_calibration(calibration);
                Some(self.calibrations.signal_path(&calibration.identifier))
            }
            None => None,
        };
        let descriptor =
            self.observations
                .write(&observation, &signal, calibration_signal.as_deref())?;
        info!("[Capture] wrote {}", observation.identifier);
        Ok(descriptor)
    }
}

impl Worker for WatchSky {
    fn name(&self) -> &'static str {
        "Watch Sky"
    }

    fn run(&mut self) -> Result<(), AgentError> {
        info!("[Capture] using radio `{}`", self.radio.name());
        self.warm_up()?;
        loop {
            self.tick(Utc::now())?;
            thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, Telescope};
    use crate::simulated_radio::SimulatedRadio;
    use crate::status::{status_channel, LightCommand, StatusEvent};
    use chrono::Duration as Span;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            frequency: 1_420_000_000,
            sample_rate: 2_048_000,
            sample_size: 256,
            gain: 20.0,
            ppm: 0,
            bandwidth: 1_000_000,
            warm_up_samples: 16,
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        observations: CaptureDir,
        calibrations: CaptureDir,
        flags: Flags,
        events: crossbeam::channel::Receiver<StatusEvent>,
        watch: WatchSky,
    }

    fn rig(healthy: bool, tasks: &[Task], flags: Flags) -> Rig {
        let radio = SimulatedRadio::builder().paced(false).healthy(healthy).build();
        rig_with(Box::new(radio), tasks, flags)
    }

    fn rig_with(radio: Box<dyn Radio>, tasks: &[Task], flags: Flags) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TaskStore::open(dir.path().join("db.sqlite")).unwrap();
        let telescope = Telescope {
            id: 1,
            name: "dish".to_owned(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0.0,
        };
        store.replace_all(&telescope, tasks).unwrap();

        let observations = CaptureDir::open(dir.path().join("capture")).unwrap();
        let calibrations = CaptureDir::open(dir.path().join("calibration")).unwrap();
        let (status, events) = status_channel();
        let watch = WatchSky::new(
            radio,
            store,
            observations.clone(),
            calibrations.clone(),
            flags.clone(),
            status,
            settings(),
            Duration::ZERO,
        );
        Rig {
            _dir: dir,
            observations,
            calibrations,
            flags,
            events,
            watch,
        }
    }

    fn task(id: &str, now: DateTime<Utc>) -> Task {
        Task {
            id: id.to_owned(),
            start_at: now - Span::minutes(1),
            end_at: now + Span::minutes(1),
            frequency: 100_000_000,
            sample_rate: 1_024_000,
            sample_size: 128,
            ppm: 0,
            gain: 10,
        }
    }

    #[test]
    fn calibrates_then_tags_observations() {
        let now = Utc::now();
        let mut rig = rig(true, &[task("A", now)], Flags::new(true, true));

        assert_eq!(rig.watch.tick(now).unwrap(), 1);
        assert!(!rig.flags.should_calibrate());

        let calibration = rig.watch.calibration().unwrap().clone();
        assert!(calibration.identifier.starts_with("calibration-"));
        assert!(rig
            .calibrations
            .descriptor_path(&calibration.identifier)
            .exists());

        let pending = rig.observations.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        let observation = crate::capture_file::read_descriptor(&pending[0]).unwrap();
        assert!(observation.identifier.starts_with("A-"));
        assert_eq!(observation.frequency, 100_000_000);
        assert_eq!(observation.bandwidth, 1_000_000);
        assert_eq!(
            observation.calibration.as_ref().unwrap().identifier,
            calibration.identifier
        );
        assert!(rig
            .observations
            .calibration_path(&observation.identifier)
            .exists());
    }

    #[test]
    fn recalibration_replaces_the_old_files() {
        let now = Utc::now();
        let mut rig = rig(true, &[], Flags::new(true, true));
        rig.watch.tick(now).unwrap();
        let first = rig.watch.calibration().unwrap().identifier.clone();

        rig.flags.request_calibration();
        rig.watch.tick(now).unwrap();
        let second = rig.watch.calibration().unwrap().identifier.clone();

        assert_ne!(first, second);
        assert!(!rig.calibrations.signal_path(&first).exists());
        assert!(rig.calibrations.signal_path(&second).exists());
    }

    #[test]
    fn nothing_is_captured_when_not_observing() {
        let now = Utc::now();
        let mut rig = rig(true, &[task("A", now)], Flags::new(false, false));
        assert_eq!(rig.watch.tick(now).unwrap(), 0);
        assert!(rig.observations.pending(10).unwrap().is_empty());
        assert!(rig.watch.calibration().is_none());

        // Outside the window, even when observing.
        rig.flags.set_observe(true);
        assert_eq!(rig.watch.tick(now + Span::hours(1)).unwrap(), 0);
    }

    #[test]
    fn failed_read_is_fatal_and_flagged() {
        let now = Utc::now();
        let mut rig = rig(false, &[task("A", now)], Flags::new(false, true));
        assert!(matches!(rig.watch.tick(now), Err(AgentError::Radio(_))));

        let commands: Vec<LightCommand> = rig
            .events
            .try_iter()
            .map(|StatusEvent::Light { command, .. }| command)
            .collect();
        assert_eq!(commands.first(), Some(&LightCommand::On));
        assert_eq!(commands.last(), Some(&LightCommand::Off));
        assert!(commands.contains(&LightCommand::FlashSlow { n: 3, end_on: true }));
    }

    #[test]
    fn warm_up_reads_and_discards() {
        let mut rig = rig(true, &[], Flags::new(false, false));
        rig.watch.warm_up().unwrap();
        assert!(rig.observations.pending(10).unwrap().is_empty());
    }

    #[test]
    fn task_ids_never_escape_the_capture_directory() {
        let now = Utc::now();
        let mut rig = rig(true, &[task("group/A", now)], Flags::new(false, true));

        assert_eq!(rig.watch.tick(now).unwrap(), 1);
        let pending = rig.observations.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        let observation = crate::capture_file::read_descriptor(&pending[0]).unwrap();
        assert!(observation.identifier.starts_with("group_A-"));
        assert_eq!(pending[0].parent(), Some(rig.observations.root()));
    }

    /// Asks for another calibration in the middle of every read.
    struct Impatient {
        inner: SimulatedRadio,
        flags: Flags,
    }

    impl Radio for Impatient {
        fn name(&self) -> &str {
            "impatient"
        }

        fn test(&mut self) -> bool {
            self.inner.test()
        }

        fn read(&mut self, params: &CaptureParams) -> Result<crate::radio::Signal, crate::radio::RadioError> {
            self.flags.request_calibration();
            self.inner.read(params)
        }
    }

    #[test]
    fn calibration_requested_during_a_reading_is_kept() {
        let flags = Flags::new(true, false);
        let radio = Impatient {
            inner: SimulatedRadio::builder().paced(false).build(),
            flags: flags.clone(),
        };
        let mut rig = rig_with(Box::new(radio), &[], flags);

        rig.watch.tick(Utc::now()).unwrap();
        assert!(rig.watch.calibration().is_some());
        assert!(rig.flags.should_calibrate());
    }

    #[test]
    fn failed_calibration_stays_requested() {
        let mut rig = rig(false, &[], Flags::new(true, false));
        assert!(rig.watch.tick(Utc::now()).is_err());
        assert!(rig.flags.should_calibrate());
        assert!(rig.watch.calibration().is_none());
    }
}
