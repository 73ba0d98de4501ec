//! Logging for the whole agent goes through one channel.
//!
//! [`ChannelLogger`] is installed as the `log` backend. It filters records
//! with an `env_logger` filter built from the `--log-level` argument and
//! hands each accepted record to the log worker as a [`LogLine`]. The worker
//! ([`LogSink`]) is the only thing that touches stdout and the log file.

use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, Sender};
use log::{Level, Log, Metadata, Record, SetLoggerError};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    time::Duration,
};

/// Slots in the log channel. When it is full new lines are dropped; logging
/// never blocks a worker.
pub const LOG_CHANNEL_CAPACITY: usize = 4096;

/// One formatted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

impl LogLine {
    /// `<timestamp> [<LEVEL>]: <message>`
    pub fn render(&self) -> String {
        format!(
            "{} [{}]: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

/// What travels on the log channel.
#[derive(Debug)]
pub enum LogMessage {
    /// A record to write.
    Line(LogLine),
    /// Answered once every line queued before it has been written.
    Flush(Sender<()>),
}

/// Creates the log channel.
pub fn log_channel() -> (LogHandle, Receiver<LogMessage>) {
    let (tx, rx) = channel::bounded(LOG_CHANNEL_CAPACITY);
    (LogHandle { tx }, rx)
}

/// Producer side of the log channel.
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: Sender<LogMessage>,
}

impl LogHandle {
    /// Waits up to `timeout` for the log worker to write out everything
    /// queued so far. Returns false if it did not answer in time.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send_timeout(LogMessage::Flush(ack_tx), timeout).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

/// The `log` backend.
pub struct ChannelLogger {
    filter: env_logger::Logger,
    tx: Sender<LogMessage>,
}

impl ChannelLogger {
    /// `filters` uses the `RUST_LOG` syntax, so both `debug` and
    /// `astronomer=debug,reqwest=warn` work. Only the filtering half of the
    /// `env_logger` logger is used; output goes through the channel.
    pub fn new(filters: &str, handle: &LogHandle) -> Self {
        Self {
            filter: env_logger::Builder::new()
                .parse_filters(&filters.to_ascii_lowercase())
                .build(),
            tx: handle.tx.clone(),
        }
    }

    /// Installs this logger for the whole process.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let max = self.filter.filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max);
        Ok(())
    }
}

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.filter.matches(record) {
            return;
        }
        let line = LogLine {
            timestamp: Local::now(),
            level: record.level(),
            message: record.args().to_string(),
        };
        // A full channel drops the line.
        let _ = self.tx.try_send(LogMessage::Line(line));
    }

    fn flush(&self) {}
}

/// Where the log worker writes.
pub struct LogSink {
    stdout: bool,
    file: Option<File>,
}

impl LogSink {
    /// Appends to `path` (created if missing), and echoes to stdout when
    /// `stdout` is set.
    pub fn open(path: Option<&Path>, stdout: bool) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        Ok(Self { stdout, file })
    }

    /// Writes one line everywhere it should go.
    pub fn write_line(&mut self, line: &LogLine) -> io::Result<()> {
        let text = line.render();
        if self.stdout {
            writeln!(io::stdout().lock(), "{text}")?;
        }
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{text}")?;
        }
        Ok(())
    }

    /// Drains `rx` until every sender is gone.
    pub fn run(&mut self, rx: &Receiver<LogMessage>) {
        for message in rx.iter() {
            self.handle(message);
        }
    }

    /// Writes whatever is queued right now, without waiting for more.
    pub fn drain(&mut self, rx: &Receiver<LogMessage>) {
        for message in rx.try_iter() {
            self.handle(message);
        }
    }

    fn handle(&mut self, message: LogMessage) {
        match message {
            LogMessage::Line(line) => {
                if let Err(e) = self.write_line(&line) {
                    // Nowhere else to report this.
                    eprintln!("[Log Worker] unable to write log line: {e}");
                }
            }
            LogMessage::Flush(ack) => {
                if let Some(file) = self.file.as_mut() {
                    let _ = file.flush();
                }
                let _ = io::stdout().flush();
                let _ = ack.send(());
            }
        }
    }
}
