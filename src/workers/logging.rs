//! The log worker: the one place log lines are written from.

use crate::error::AgentError;
use crate::logger::{LogMessage, LogSink};
use crate::worker::Worker;

use crossbeam::channel::Receiver;

/// Writes everything queued on the log channel.
pub struct LogWorker {
    sink: LogSink,
    lines: Receiver<LogMessage>,
}

impl LogWorker {
    /// Writes every message from `lines` to `sink`.
    pub fn new(sink: LogSink, lines: Receiver<LogMessage>) -> Self {
        Self { sink, lines }
    }
}

impl Worker for LogWorker {
    fn name(&self) -> &'static str {
        "Log Worker"
    }

    /// Returns once every producer is gone.
    fn run(&mut self) -> Result<(), AgentError> {
        self.sink.run(&self.lines);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{log_channel, ChannelLogger};
    use crate::worker::{spawn_worker, Outcome};
    use crossbeam::channel::unbounded;
    use log::{Level, Log, Record};
    use std::time::Duration;

    #[test]
    fn ends_when_the_channel_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let (handle, rx) = log_channel();
        let logger = ChannelLogger::new("info", &handle);

        let (exits, exited) = unbounded();
        let sink = LogSink::open(Some(&path), false).unwrap();
        let thread = spawn_worker(Box::new(LogWorker::new(sink, rx)), exits).unwrap();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("astronomer")
                .args(format_args!("first light"))
                .build(),
        );
        assert!(handle.flush(Duration::from_secs(5)));
        drop(logger);
        drop(handle);

        thread.join().unwrap();
        let exit = exited.recv().unwrap();
        assert_eq!(exit.name, "Log Worker");
        assert_eq!(exit.outcome, Outcome::Returned);
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("[INFO]: first light"));
    }
}
