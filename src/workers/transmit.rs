//! Ships finished spectra home.
//!
//! Waits until the control plane answers its health check, then every
//! interval uploads a batch of the oldest descriptor sets from the spectrum
//! directory. A set is only deleted after every file in it was accepted;
//! anything else leaves it for the next pass.

use crate::error::AgentError;
use crate::remote::RemoteApi;
use crate::status::{StatusChannel, StatusSender};
use crate::worker::Worker;

use log::{debug, error, info, warn};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Files a complete set has: the spectrum, its plot and the descriptor.
pub const FILES_PER_SET: usize = 3;

/// What happened to one descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every file was accepted and the set deleted.
    Sent,
    /// The set was missing files; the ones present were accepted and
    /// deleted.
    Partial,
    /// An upload failed; the set is still on disk.
    Kept,
    /// The descriptor named no identifier and was deleted.
    Purged,
}

/// Uploads spectra.
pub struct Transmit<R> {
    remote: R,
    dir: PathBuf,
    batch_size: usize,
    interval: Duration,
    max_jitter: Duration,
    status: StatusSender,
}

impl<R: RemoteApi> Transmit<R> {
    /// Uploads from `dir`, at most `batch_size` sets every `interval`.
    pub fn new(
        remote: R,
        dir: impl Into<PathBuf>,
        batch_size: usize,
        interval: Duration,
        max_jitter: Duration,
        status: StatusSender,
    ) -> Self {
        Self {
            remote,
            dir: dir.into(),
            batch_size: batch_size.max(1),
            interval,
            max_jitter,
            status,
        }
    }

    /// Blocks until the health check passes, retrying every interval.
    pub fn wait_for_home(&self) {
        loop {
            match self.remote.health_check() {
                Ok(()) => {
                    info!("[Transmit] home is reachable");
                    return;
                }
                Err(e) => {
                    error!("[Transmit] health check failed: {e}");
                    thread::sleep(self.interval);
                }
            }
        }
    }

    /// Descriptors in name order, at most one batch.
    pub fn batch(&self) -> Result<Vec<PathBuf>, glob::PatternError> {
        let pattern = self.dir.join("*.json");
        let mut found: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .collect();
        found.sort();
        found.truncate(self.batch_size);
        Ok(found)
    }

    /// Uploads one batch, pausing a random jitter between sets.
    pub fn pass(&self) -> Result<Vec<Delivery>, AgentError> {
        let batch = self
            .batch()
            .map_err(crate::capture_file::CaptureFileError::from)?;
        let mut deliveries = Vec::with_capacity(batch.len());
        for (i, descriptor) in batch.iter().enumerate() {
            if i > 0 {
                self.jitter();
            }
            deliveries.push(self.deliver(descriptor));
        }
        Ok(deliveries)
    }

    /// Sends the set `descriptor` belongs to.
    pub fn deliver(&self, descriptor: &Path) -> Delivery {
        let Some(identifier) = read_identifier(descriptor) else {
            warn!(
                "[Transmit] {} names no sample, removing it",
                descriptor.display()
            );
            if let Err(e) = fs::remove_file(descriptor) {
                warn!("[Transmit] unable to remove {}: {e}", descriptor.display());
            }
            return Delivery::Purged;
        };

        let files = self.set_of(&identifier);
        let complete = files.len() == FILES_PER_SET;
        if !complete {
            warn!(
                "[Transmit] malformed sample {identifier} ({} files), uploading partial",
                files.len()
            );
        }

        let light = self.status.managed(StatusChannel::Transmit);
        for file in &files {
            debug!("[Transmit] uploading {}", file.display());
            match self.remote.upload(file) {
                Ok(ack) => debug!("[Transmit] {} acknowledged: {ack}", file.display()),
                Err(e) => {
                    warn!("[Transmit] failed to transmit {identifier}: {e}");
                    light.error();
                    return Delivery::Kept;
                }
            }
        }
        drop(light);

        for file in &files {
            if let Err(e) = fs::remove_file(file) {
                warn!("[Transmit] unable to remove {}: {e}", file.display());
            }
        }
        info!("[Transmit] sent {identifier}");
        self.status.flash_ok(StatusChannel::Analysis);
        if complete {
            Delivery::Sent
        } else {
            Delivery::Partial
        }
    }

    /// Every file of the set named `identifier`, descriptor included.
    fn set_of(&self, identifier: &str) -> Vec<PathBuf> {
        let pattern = self
            .dir
            .join(format!("{}.*", glob::Pattern::escape(identifier)));
        let mut files: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!("[Transmit] bad pattern for {identifier}: {e}");
                Vec::new()
            }
        };
        files.sort();
        files
    }

    fn jitter(&self) {
        let pause = self.pick_jitter();
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    /// A random pause of at most `max_jitter`, in whole milliseconds.
    fn pick_jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

fn read_identifier(descriptor: &Path) -> Option<String> {
    let text = fs::read(descriptor).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&text).ok()?;
    value
        .get("identifier")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

impl<R: RemoteApi> Worker for Transmit<R> {
    fn name(&self) -> &'static str {
        "Transmit"
    }

    fn run(&mut self) -> Result<(), AgentError> {
        self.wait_for_home();
        loop {
            match self.pass() {
                Ok(deliveries) if !deliveries.is_empty() => debug!(
                    "[Transmit] pass done: {} sent",
                    deliveries
                        .iter()
                        .filter(|d| matches!(d, Delivery::Sent | Delivery::Partial))
                        .count()
                ),
                Ok(_) => {}
                Err(e) => warn!("[Transmit] pass failed: {e}"),
            }
            thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;
    use crate::status::status_channel;

    fn transmit(dir: &Path, remote: &FakeRemote) -> Transmit<FakeRemote> {
        let (status, _events) = status_channel();
        Transmit::new(
            remote.clone(),
            dir,
            4,
            Duration::ZERO,
            Duration::ZERO,
            status,
        )
    }

    fn write_set(dir: &Path, id: &str, with_plot: bool) {
        fs::write(
            dir.join(format!("{id}.json")),
            format!("{{\"identifier\":\"{id}\"}}"),
        )
        .unwrap();
        fs::write(dir.join(format!("{id}.spec")), b"spec").unwrap();
        if with_plot {
            fs::write(dir.join(format!("{id}.png")), b"png").unwrap();
        }
    }

    #[test]
    fn complete_set_is_sent_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        write_set(dir.path(), "A-1", true);

        let deliveries = transmit(dir.path(), &remote).pass().unwrap();
        assert_eq!(deliveries, vec![Delivery::Sent]);
        assert_eq!(remote.state.lock().unwrap().uploads.len(), 3);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn partial_set_is_still_sent() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        write_set(dir.path(), "A-1", false);

        let link = transmit(dir.path(), &remote);
        assert_eq!(link.deliver(&dir.path().join("A-1.json")), Delivery::Partial);
        let uploads = remote.state.lock().unwrap().uploads.clone();
        assert_eq!(
            uploads,
            vec![dir.path().join("A-1.json"), dir.path().join("A-1.spec")]
        );
        assert!(!dir.path().join("A-1.spec").exists());
    }

    #[test]
    fn partial_set_with_a_failing_upload_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        remote
            .state
            .lock()
            .unwrap()
            .failing_uploads
            .insert("A-1.spec".to_owned());
        write_set(dir.path(), "A-1", false);

        let link = transmit(dir.path(), &remote);
        assert_eq!(link.deliver(&dir.path().join("A-1.json")), Delivery::Kept);
        assert!(dir.path().join("A-1.json").exists());
        assert!(dir.path().join("A-1.spec").exists());
    }

    #[test]
    fn jitter_stays_within_its_bound() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        let mut link = transmit(dir.path(), &remote);
        assert_eq!(link.pick_jitter(), Duration::ZERO);

        link.max_jitter = Duration::from_millis(5);
        for _ in 0..100 {
            assert!(link.pick_jitter() <= Duration::from_millis(5));
        }

        // Too many milliseconds for a u64 saturates instead of wrapping.
        link.max_jitter = Duration::MAX;
        for _ in 0..100 {
            assert!(link.pick_jitter() <= Duration::MAX);
        }
    }

    #[test]
    fn failed_upload_keeps_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        remote
            .state
            .lock()
            .unwrap()
            .failing_uploads
            .insert("A-1.spec".to_owned());
        write_set(dir.path(), "A-1", true);

        let deliveries = transmit(dir.path(), &remote).pass().unwrap();
        assert_eq!(deliveries, vec![Delivery::Kept]);
        for ext in ["json", "spec", "png"] {
            assert!(dir.path().join(format!("A-1.{ext}")).exists());
        }
    }

    #[test]
    fn descriptor_without_identifier_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        fs::write(dir.path().join("junk.json"), b"{\"frequency\":1}").unwrap();
        fs::write(dir.path().join("junk.png"), b"png").unwrap();

        let deliveries = transmit(dir.path(), &remote).pass().unwrap();
        assert_eq!(deliveries, vec![Delivery::Purged]);
        assert!(!dir.path().join("junk.json").exists());
        assert!(remote.state.lock().unwrap().uploads.is_empty());
    }

    #[test]
    fn batches_are_capped_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::healthy();
        for id in ["E-5", "E-1", "E-3", "E-2", "E-4"] {
            write_set(dir.path(), id, true);
        }
        let link = transmit(dir.path(), &remote);
        let batch = link.batch().unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0], dir.path().join("E-1.json"));
        assert_eq!(batch[3], dir.path().join("E-4.json"));
    }

    #[test]
    fn waits_for_home_until_healthy() {
        let remote = FakeRemote::default();
        let dir = tempfile::tempdir().unwrap();
        let link = transmit(dir.path(), &remote);

        let flip = remote.clone();
        let waiter = thread::spawn(move || link.wait_for_home());
        while flip.state.lock().unwrap().health_checks < 2 {
            thread::yield_now();
        }
        flip.state.lock().unwrap().healthy = true;
        waiter.join().unwrap();
        assert!(remote.state.lock().unwrap().health_checks >= 3);
    }
}
