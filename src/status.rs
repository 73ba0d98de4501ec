//! The shared coordination state every worker is handed: the status-event
//! channel feeding the indicator lights, and the two flags that say whether
//! to calibrate and whether to observe.

use crossbeam::channel::{Receiver, Sender};
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The named status lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusChannel {
    Capture,
    Calibrate,
    Transmit,
    Downlink,
    Analysis,
}

impl StatusChannel {
    /// Every channel, in pin-table order.
    pub const ALL: [StatusChannel; 5] = [
        StatusChannel::Capture,
        StatusChannel::Calibrate,
        StatusChannel::Transmit,
        StatusChannel::Downlink,
        StatusChannel::Analysis,
    ];

    /// Lower-case name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            StatusChannel::Capture => "capture",
            StatusChannel::Calibrate => "calibrate",
            StatusChannel::Transmit => "transmit",
            StatusChannel::Downlink => "downlink",
            StatusChannel::Analysis => "analysis",
        }
    }
}

impl fmt::Display for StatusChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a light should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightCommand {
    On,
    Off,
    /// `n` quick off/on/off cycles, then on if `end_on`.
    FlashFast { n: u32, end_on: bool },
    /// `n` slow off/on/off cycles, then on if `end_on`.
    FlashSlow { n: u32, end_on: bool },
    /// Two fast flashes.
    FlashOk,
    /// Three slow flashes.
    FlashError,
}

/// A message on the status-event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// Run `command` on the light for `channel`.
    Light {
        /// Which light.
        channel: StatusChannel,
        /// What it should do.
        command: LightCommand,
    },
}

/// Creates the status-event channel. It is unbounded: sending never blocks
/// a worker and never loses the `Off` that closes a managed scope.
pub fn status_channel() -> (StatusSender, Receiver<StatusEvent>) {
    let (tx, rx) = crossbeam::channel::unbounded();
    (StatusSender { tx }, rx)
}

/// The producing end of the status-event channel. Cheap to clone; every
/// worker holds one.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: Sender<StatusEvent>,
}

impl StatusSender {
    /// Queues `command` for the light on `channel`.
    pub fn send(&self, channel: StatusChannel, command: LightCommand) {
        // Only fails once the indicator is gone, and then nobody is looking.
        let _ = self.tx.send(StatusEvent::Light { channel, command });
    }

    /// Two quick flashes on `channel`.
    pub fn flash_ok(&self, channel: StatusChannel) {
        self.send(channel, LightCommand::FlashOk);
    }

    /// Three slow flashes on `channel`.
    pub fn flash_error(&self, channel: StatusChannel) {
        self.send(channel, LightCommand::FlashError);
    }

    /// Turns the light on and hands back a guard that turns it off again
    /// when it goes out of scope, however that happens.
    pub fn managed(&self, channel: StatusChannel) -> ManagedStatus {
        self.managed_with(channel, LightCommand::On)
    }

    /// As [`StatusSender::managed`], starting from `initial` instead of on.
    pub fn managed_with(&self, channel: StatusChannel, initial: LightCommand) -> ManagedStatus {
        self.send(channel, initial);
        ManagedStatus {
            sender: self.clone(),
            channel,
        }
    }
}

/// Scope guard from [`StatusSender::managed`].
#[derive(Debug)]
pub struct ManagedStatus {
    sender: StatusSender,
    channel: StatusChannel,
}

impl ManagedStatus {
    /// Changes the light while the scope is still open.
    pub fn set(&self, command: LightCommand) {
        self.sender.send(self.channel, command);
    }

    /// Flashes the error pattern, ending on.
    pub fn error(&self) {
        self.set(LightCommand::FlashSlow { n: 3, end_on: true });
    }
}

impl Drop for ManagedStatus {
    fn drop(&mut self) {
        self.sender.send(self.channel, LightCommand::Off);
    }
}

/// The two coordination flags.
///
/// `should_calibrate` is edge triggered: whoever acts on it clears it.
/// `should_observe` is level triggered and toggled from outside.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    should_calibrate: Arc<AtomicBool>,
    should_observe: Arc<AtomicBool>,
}

impl Flags {
    /// Flags starting in the given states.
    pub fn new(calibrate: bool, observe: bool) -> Self {
        Self {
            should_calibrate: Arc::new(AtomicBool::new(calibrate)),
            should_observe: Arc::new(AtomicBool::new(observe)),
        }
    }

    /// Whether a calibration has been requested.
    pub fn should_calibrate(&self) -> bool {
        self.should_calibrate.load(Ordering::Acquire)
    }

    /// Asks the capture loop for a new calibration.
    pub fn request_calibration(&self) {
        self.should_calibrate.store(true, Ordering::Release);
    }

    /// Called once the requested calibration has been taken.
    pub fn clear_calibration(&self) {
        self.should_calibrate.store(false, Ordering::Release);
    }

    /// Whether tasks should be captured.
    pub fn should_observe(&self) -> bool {
        self.should_observe.load(Ordering::Acquire)
    }

    /// Turns observing on or off.
    pub fn set_observe(&self, observe: bool) {
        self.should_observe.store(observe, Ordering::Release);
    }

    /// Flips observing on or off and returns the new state.
    pub fn toggle_observe(&self) -> bool {
        !self.should_observe.fetch_xor(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &Receiver<StatusEvent>) -> Vec<LightCommand> {
        rx.try_iter()
            .map(|StatusEvent::Light { command, .. }| command)
            .collect()
    }

    #[test]
    fn managed_scope_turns_off_on_every_exit() {
        let (status, rx) = status_channel();

        {
            let scope = status.managed(StatusChannel::Capture);
            scope.set(LightCommand::FlashOk);
        }
        assert_eq!(
            drain(&rx),
            vec![LightCommand::On, LightCommand::FlashOk, LightCommand::Off]
        );

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = status.managed(StatusChannel::Transmit);
            panic!("upload blew up");
        }));
        assert!(result.is_err());
        assert_eq!(drain(&rx), vec![LightCommand::On, LightCommand::Off]);
    }

    #[test]
    fn backlog_never_loses_the_closing_off() {
        let (status, rx) = status_channel();
        for _ in 0..10_000 {
            status.flash_error(StatusChannel::Analysis);
        }
        {
            let _scope = status.managed(StatusChannel::Capture);
        }
        assert_eq!(rx.len(), 10_002);
        let capture: Vec<LightCommand> = rx
            .try_iter()
            .filter(|StatusEvent::Light { channel, .. }| *channel == StatusChannel::Capture)
            .map(|StatusEvent::Light { command, .. }| command)
            .collect();
        assert_eq!(capture, vec![LightCommand::On, LightCommand::Off]);
    }

    #[test]
    fn sending_after_the_indicator_is_gone_is_harmless() {
        let (status, rx) = status_channel();
        drop(rx);
        let _scope = status.managed(StatusChannel::Downlink);
        status.flash_ok(StatusChannel::Downlink);
    }

    #[test]
    fn flags_are_shared_between_clones() {
        let flags = Flags::new(false, false);
        let other = flags.clone();
        other.request_calibration();
        assert!(flags.should_calibrate());
        flags.clear_calibration();
        assert!(!other.should_calibrate());

        assert!(other.toggle_observe());
        assert!(flags.should_observe());
        assert!(!flags.toggle_observe());
        assert!(!other.should_observe());
    }
}
