//! The astronomer field agent.
//!
//! Reads its settings from the environment, starts logging, and hands over
//! to the supervisor. The supervisor only returns when something has gone
//! wrong, so this always ends with a non-zero exit.

use astronomer::{
    args::AgentArgs,
    error::AgentError,
    logger::{log_channel, ChannelLogger, LogSink},
    remote::HttpRemote,
    supervisor,
    workers::logging::LogWorker,
};

use clap::Parser;
use log::error;
use std::{process, time::Duration};

/// How long the log worker gets to write out the last lines.
const FINAL_FLUSH: Duration = Duration::from_secs(2);

fn main() {
    let settings = AgentArgs::parse().settings();

    let (log, lines) = log_channel();
    if let Err(e) = ChannelLogger::new(&settings.log_level, &log).install() {
        eprintln!("unable to install logger: {e}");
        process::exit(1);
    }
    let sink = match LogSink::open(Some(&settings.log_file), true) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("unable to open {}: {e}", settings.log_file.display());
            process::exit(1);
        }
    };

    let result = HttpRemote::new(
        settings.endpoints.clone(),
        &settings.token,
        settings.request_timeout,
        settings.stream_timeout,
    )
    .map_err(AgentError::from)
    .and_then(|remote| {
        supervisor::run(
            &settings,
            settings.radio.clone().build(),
            remote,
            Some(LogWorker::new(sink, lines.clone())),
        )
    });

    if let Err(e) = result {
        error!("[Supervisor] shutting down: {e}");
    }
    if !log.flush(FINAL_FLUSH) {
        // The log worker never started; write what is queued ourselves.
        if let Ok(mut sink) = LogSink::open(Some(&settings.log_file), true) {
            sink.drain(&lines);
        }
    }
    process::exit(1);
}
