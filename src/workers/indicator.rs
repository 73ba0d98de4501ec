//! Drives the status lights and listens for the operator.
//!
//! Status events from every other worker are routed to the light for their
//! channel. Each light runs on its own thread and applies its commands in
//! order, so a long flash on one light never delays another. When an input address is configured the operator
//! panel can also send single words over TCP: `calibrate` requests a new
//! calibration and `observe` toggles observing.

use crate::args::StatusPins;
use crate::error::AgentError;
use crate::status::{Flags, LightCommand, StatusChannel, StatusEvent};
use crate::status_light::{Light, LogPin, PanelPin, Pin, Timing};
use crate::worker::Worker;

use crossbeam::channel::Receiver;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Longest operator message read.
const MAX_INPUT: u64 = 255;

/// How long the panel gets to accept a pin update.
const PANEL_TIMEOUT: Duration = Duration::from_millis(500);

/// A word from the operator panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    /// `calibrate`
    Calibrate,
    /// `observe`
    ToggleObserve,
    /// Anything else.
    Unknown(String),
}

impl OperatorInput {
    /// Reads one operator message. Surrounding whitespace is ignored.
    pub fn parse(message: &str) -> Self {
        match message.trim() {
            "calibrate" => OperatorInput::Calibrate,
            "observe" => OperatorInput::ToggleObserve,
            other => OperatorInput::Unknown(other.to_owned()),
        }
    }

    /// Acts on the shared flags.
    pub fn apply(&self, flags: &Flags) {
        match self {
            OperatorInput::Calibrate => {
                flags.request_calibration();
                info!("[Input] calibration requested");
            }
            OperatorInput::ToggleObserve => {
                let observing = flags.toggle_observe();
                info!("[Input] observing {}", if observing { "on" } else { "off" });
            }
            OperatorInput::Unknown(word) => warn!("[Input] unknown command `{word}`"),
        }
    }
}

/// Owns the lights.
pub struct Indicator {
    events: Receiver<StatusEvent>,
    lights: HashMap<StatusChannel, Light>,
    flags: Flags,
    input: Option<TcpListener>,
}

impl Indicator {
    /// Lights use the panel at `panel` when given, otherwise they only log.
    pub fn new(
        events: Receiver<StatusEvent>,
        pins: &StatusPins,
        panel: Option<SocketAddr>,
        timing: Timing,
        flags: Flags,
    ) -> Self {
        let lights = StatusChannel::ALL
            .into_iter()
            .map(|channel| {
                let number = pins.pin_for(channel);
                let pin: Box<dyn Pin> = match panel {
                    Some(addr) => Box::new(PanelPin::new(number, addr, PANEL_TIMEOUT)),
                    None => Box::new(LogPin::new(number)),
                };
                (channel, Light::new(channel, pin, timing))
            })
            .collect();
        Self::with_lights(events, lights, flags)
    }

    /// Uses the given lights as they are.
    pub fn with_lights(
        events: Receiver<StatusEvent>,
        lights: HashMap<StatusChannel, Light>,
        flags: Flags,
    ) -> Self {
        Self {
            events,
            lights,
            flags,
            input: None,
        }
    }

    /// Listens for operator input on `addr` once running.
    pub fn listen(mut self, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("[Input] listening on {}", listener.local_addr()?);
        self.input = Some(listener);
        Ok(self)
    }

    /// Where operator input is accepted, if anywhere.
    pub fn input_addr(&self) -> Option<SocketAddr> {
        self.input.as_ref().and_then(|l| l.local_addr().ok())
    }
}

fn drive(mut light: Light, commands: Receiver<LightCommand>) {
    for command in commands.iter() {
        light.apply(command);
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<thread::JoinHandle<()>, AgentError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| AgentError::Spawn { name, source })
}

fn serve_input(listener: TcpListener, flags: Flags) {
    for stream in listener.incoming() {
        match stream.and_then(read_message) {
            Ok(message) => OperatorInput::parse(&message).apply(&flags),
            Err(e) => warn!("[Input] connection failed: {e}"),
        }
    }
}

fn read_message(stream: TcpStream) -> io::Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = Vec::new();
    stream.take(MAX_INPUT).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl Worker for Indicator {
    fn name(&self) -> &'static str {
        "Indicator"
    }

    fn run(&mut self) -> Result<(), AgentError> {
        if let Some(listener) = self.input.take() {
            let flags = self.flags.clone();
            spawn_named("Input".to_owned(), move || serve_input(listener, flags))?;
        }

        let mut routes = HashMap::new();
        let mut drivers = Vec::new();
        for (channel, light) in self.lights.drain() {
            let (tx, rx) = crossbeam::channel::unbounded();
            drivers.push(spawn_named(format!("Light {channel}"), move || {
                drive(light, rx)
            })?);
            routes.insert(channel, tx);
        }

        while let Ok(StatusEvent::Light { channel, command }) = self.events.recv() {
            match routes.get(&channel) {
                Some(light) => {
                    let _ = light.send(command);
                }
                None => debug!("[I/O] no light for {channel}"),
            }
        }

        // Lights finish what is queued before the worker reports its exit.
        drop(routes);
        for driver in drivers {
            if driver.join().is_err() {
                warn!("[I/O] a light thread panicked");
            }
        }
        Ok(())
    }
}
