//! Starts the agent and watches its workers.
//!
//! The radio is tested before anything else happens: if it does not answer,
//! no directory, database or thread is touched and the agent stops. Once it
//! passes, every worker gets its own thread. The first worker to stop, for
//! whatever reason, stops the agent.

use crate::args::Settings;
use crate::capture_file::CaptureDir;
use crate::error::AgentError;
use crate::radio::Radio;
use crate::remote::RemoteApi;
use crate::status::{status_channel, Flags, LightCommand, StatusChannel, StatusSender};
use crate::status_light::Timing;
use crate::store::TaskStore;
use crate::worker::{spawn_worker, Worker, WorkerExit};
use crate::workers::downlink::Downlink;
use crate::workers::indicator::Indicator;
use crate::workers::logging::LogWorker;
use crate::workers::spectrum::SpectrumWorker;
use crate::workers::transmit::Transmit;
use crate::workers::watch_sky::WatchSky;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{error, info};
use std::thread::JoinHandle;

/// Runs the radio self-test with the capture light as the indicator.
pub fn self_test(radio: &mut dyn Radio, status: &StatusSender) -> Result<(), AgentError> {
    let light = status.managed_with(StatusChannel::Capture, LightCommand::Off);
    info!("[Capture] testing radio `{}`...", radio.name());
    if radio.test() {
        light.set(LightCommand::FlashOk);
        info!("[Capture] radio self-test passed");
        Ok(())
    } else {
        light.set(LightCommand::FlashError);
        error!("[Capture] radio self-test failed");
        Err(AgentError::SelfTestFailed)
    }
}

/// Owns the worker threads.
pub struct Supervisor {
    exits: Sender<WorkerExit>,
    exited: Receiver<WorkerExit>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        let (exits, exited) = unbounded();
        Self {
            exits,
            exited,
            threads: Vec::new(),
        }
    }
}

impl Supervisor {
    /// An empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `worker` on its own thread.
    pub fn spawn(&mut self, worker: Box<dyn Worker>) -> Result<(), AgentError> {
        let thread = spawn_worker(worker, self.exits.clone())?;
        self.threads.push(thread);
        Ok(())
    }

    /// Workers started so far.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no worker has been started.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Blocks until the first worker stops and returns it as an error. The
    /// other threads are left running; the process is expected to exit.
    pub fn wait(self) -> AgentError {
        let name = match self.exited.recv() {
            Ok(exit) => {
                error!("[Supervisor] worker `{}` {}", exit.name, exit.outcome);
                exit.name.to_owned()
            }
            // Unreachable while we hold a sender.
            Err(_) => "unknown".to_owned(),
        };
        AgentError::WorkerExited { name }
    }
}

/// Self-tests the radio, starts every worker and waits for the first one to
/// stop. Only ever returns an error.
pub fn run<R>(
    settings: &Settings,
    mut radio: Box<dyn Radio>,
    remote: R,
    log: Option<LogWorker>,
) -> Result<(), AgentError>
where
    R: RemoteApi + Clone + 'static,
{
    let (status, events) = status_channel();
    let flags = Flags::new(settings.calibrate_on_start, settings.observe_on_start);

    self_test(radio.as_mut(), &status)?;

    let mut indicator = Indicator::new(
        events,
        &settings.pins,
        settings.indicator_panel,
        Timing::default(),
        flags.clone(),
    );
    if let Some(addr) = settings.input_listen {
        indicator = indicator.listen(addr)?;
    }

    let observations = CaptureDir::open(&settings.capture_dir)?;
    let calibrations = CaptureDir::open(&settings.calibration_dir)?;
    let spectra = CaptureDir::open(&settings.spectrum_dir)?;

    let downlink = Downlink::new(
        remote.clone(),
        TaskStore::open(&settings.database)?,
        status.clone(),
        settings.reconnect_delay,
    )?;
    let watch_sky = WatchSky::new(
        radio,
        TaskStore::open(&settings.database)?,
        observations.clone(),
        calibrations,
        flags,
        status.clone(),
        settings.capture,
        settings.capture_interval,
    );
    let spectrum = SpectrumWorker::new(
        observations,
        spectra.clone(),
        settings.spectrum_batch_size,
        settings.buffer_length,
        settings.processing_interval,
        status.clone(),
    );
    let transmit = Transmit::new(
        remote,
        spectra.root(),
        settings.transmit_batch_size,
        settings.background_interval,
        settings.transmit_max_jitter,
        status,
    );

    let mut supervisor = Supervisor::new();
    if let Some(log) = log {
        supervisor.spawn(Box::new(log))?;
    }
    supervisor.spawn(Box::new(indicator))?;
    supervisor.spawn(Box::new(downlink))?;
    supervisor.spawn(Box::new(watch_sky))?;
    supervisor.spawn(Box::new(spectrum))?;
    supervisor.spawn(Box::new(transmit))?;
    info!("[Supervisor] {} workers running", supervisor.len());

    Err(supervisor.wait())
}
