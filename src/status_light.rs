//! Physical status lights.
//!
//! A [`Light`] drives one output [`Pin`]. On a field station the pin table
//! maps each [`StatusChannel`] to a GPIO line; off the Pi the lights either
//! log their transitions ([`LogPin`]) or mirror them to a test panel over
//! TCP ([`PanelPin`]).
//!
//! Turning a light off within [`Timing::floor`] of turning it on waits out
//! the rest of the floor first, so even the shortest unit of work leaves a
//! visible blink.

use crate::status::{LightCommand, StatusChannel};

use log::{debug, warn};
use std::{
    io::{self, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

/// An output line a light is wired to.
pub trait Pin: Send {
    /// GPIO number, for logs and the panel protocol.
    fn number(&self) -> u8;

    /// Drives the line high or low.
    fn set(&mut self, high: bool) -> io::Result<()>;
}

/// A pin that only writes its transitions to the log.
#[derive(Debug, Clone)]
pub struct LogPin {
    pin: u8,
}

impl LogPin {
    /// A pin that logs as `pin`.
    pub fn new(pin: u8) -> Self {
        Self { pin }
    }
}

impl Pin for LogPin {
    fn number(&self) -> u8 {
        self.pin
    }

    fn set(&mut self, high: bool) -> io::Result<()> {
        debug!("[I/O] pin {} {}", self.pin, if high { "on" } else { "off" });
        Ok(())
    }
}

/// A pin mirrored to the indicator test panel, which listens for
/// `<pin>-1` and `<pin>-0`, one message per connection.
#[derive(Debug, Clone)]
pub struct PanelPin {
    pin: u8,
    addr: SocketAddr,
    timeout: Duration,
}

impl PanelPin {
    /// Mirrors `pin` to the panel listening at `addr`.
    pub fn new(pin: u8, addr: SocketAddr, timeout: Duration) -> Self {
        Self { pin, addr, timeout }
    }
}

impl Pin for PanelPin {
    fn number(&self) -> u8 {
        self.pin
    }

    fn set(&mut self, high: bool) -> io::Result<()> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_write_timeout(Some(self.timeout))?;
        write!(stream, "{}-{}", self.pin, u8::from(high))?;
        stream.flush()
    }
}

/// How long flashes and the on-time floor last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub fast: Duration,
    pub slow: Duration,
    pub floor: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(150),
            slow: Duration::from_millis(300),
            floor: Duration::from_secs(1),
        }
    }
}

/// One status light.
pub struct Light {
    channel: StatusChannel,
    pin: Box<dyn Pin>,
    timing: Timing,
    lit_at: Option<Instant>,
}

impl Light {
    /// A light for `channel` on `pin`, switched off to start with.
    pub fn new(channel: StatusChannel, pin: Box<dyn Pin>, timing: Timing) -> Self {
        let mut light = Self {
            channel,
            pin,
            timing,
            lit_at: None,
        };
        light.write(false);
        light
    }

    /// The channel this light shows.
    pub fn channel(&self) -> StatusChannel {
        self.channel
    }

    fn write(&mut self, high: bool) {
        if let Err(e) = self.pin.set(high) {
            warn!(
                "[I/O] unable to switch {} light (pin {}): {e}",
                self.channel,
                self.pin.number()
            );
        }
    }

    /// Switches on and starts the on-time floor.
    pub fn on(&mut self) {
        if self.lit_at.is_none() {
            self.lit_at = Some(Instant::now());
        }
        self.write(true);
    }

    /// Switches off, after waiting out the floor if the light came on
    /// only just now.
    pub fn off(&mut self) {
        if let Some(lit_at) = self.lit_at.take() {
            let elapsed = lit_at.elapsed();
            if elapsed < self.timing.floor {
                spin_sleep::sleep(self.timing.floor - elapsed);
            }
        }
        self.write(false);
    }

    fn flash(&mut self, n: u32, delay: Duration, end_on: bool) {
        self.lit_at = None;
        for _ in 0..n {
            self.write(false);
            spin_sleep::sleep(delay);
            self.write(true);
            spin_sleep::sleep(delay);
            self.write(false);
            spin_sleep::sleep(delay);
        }
        if end_on {
            self.on();
        }
    }

    /// `n` quick flashes, then on if `end_on`.
    pub fn flash_fast(&mut self, n: u32, end_on: bool) {
        self.flash(n, self.timing.fast, end_on);
    }

    /// `n` slow flashes, then on if `end_on`.
    pub fn flash_slow(&mut self, n: u32, end_on: bool) {
        self.flash(n, self.timing.slow, end_on);
    }

    /// Runs a command from the status channel.
    pub fn apply(&mut self, command: LightCommand) {
        match command {
            LightCommand::On => self.on(),
            LightCommand::Off => self.off(),
            LightCommand::FlashFast { n, end_on } => self.flash_fast(n, end_on),
            LightCommand::FlashSlow { n, end_on } => self.flash_slow(n, end_on),
            LightCommand::FlashOk => self.flash_fast(2, false),
            LightCommand::FlashError => self.flash_slow(3, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Records every level written to it.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<bool>>>);

    impl Pin for Recorder {
        fn number(&self) -> u8 {
            7
        }

        fn set(&mut self, high: bool) -> io::Result<()> {
            self.0.lock().unwrap().push(high);
            Ok(())
        }
    }

    fn quick() -> Timing {
        Timing {
            fast: Duration::from_millis(1),
            slow: Duration::from_millis(2),
            floor: Duration::from_millis(50),
        }
    }

    #[test]
    fn flashes_cycle_and_finish_in_the_end_state() {
        let recorder = Recorder::default();
        let mut light = Light::new(StatusChannel::Analysis, Box::new(recorder.clone()), quick());

        light.apply(LightCommand::FlashOk);
        light.apply(LightCommand::FlashSlow { n: 1, end_on: true });

        let levels = recorder.0.lock().unwrap().clone();
        assert_eq!(
            levels,
            vec![false, false, true, false, false, true, false, false, true, false, true]
        );
    }

    #[test]
    fn short_on_time_is_held_to_the_floor() {
        let mut light = Light::new(StatusChannel::Capture, Box::new(LogPin::new(25)), quick());
        let start = Instant::now();
        light.apply(LightCommand::On);
        light.apply(LightCommand::Off);
        assert!(start.elapsed() >= Duration::from_millis(50));

        // Already off: nothing to wait for.
        let start = Instant::now();
        light.apply(LightCommand::Off);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn panel_pin_sends_pin_and_level() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut pin = PanelPin::new(24, addr, Duration::from_secs(1));

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut msg = String::new();
                stream.read_to_string(&mut msg).unwrap();
                got.push(msg);
            }
            got
        });

        pin.set(true).unwrap();
        pin.set(false).unwrap();
        assert_eq!(reader.join().unwrap(), vec!["24-1", "24-0"]);
    }
}
