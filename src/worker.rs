//! Defines the Worker trait implemented by each long-running loop of the
//! agent. A worker runs on its own named thread and never returns during
//! normal operation; when it does, successfully, with an error, or by
//! panicking, it reports a [`WorkerExit`] so the supervisor can shut the
//! agent down.

use crate::error::AgentError;

use crossbeam::channel::Sender;
use log::{error, info};
use std::fmt;
use std::thread::{self, JoinHandle};

/// One of the agent's independent loops.
pub trait Worker: Send {
    /// Thread name, also used to tag log lines.
    fn name(&self) -> &'static str;

    /// Runs the loop. Only returns when the worker cannot carry on.
    fn run(&mut self) -> Result<(), AgentError>;
}

/// How a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `run` returned `Ok`.
    Returned,
    /// `run` returned an error, rendered here.
    Failed(String),
    /// The thread unwound.
    Panicked,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Returned => f.write_str("returned"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
            Outcome::Panicked => f.write_str("panicked"),
        }
    }
}

/// Sent by every worker thread as it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub name: &'static str,
    pub outcome: Outcome,
}

/// Reports the exit when dropped, so a panic still gets reported.
struct ExitReporter {
    name: &'static str,
    outcome: Option<Outcome>,
    exits: Sender<WorkerExit>,
}

impl Drop for ExitReporter {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(Outcome::Panicked);
        let _ = self.exits.send(WorkerExit {
            name: self.name,
            outcome,
        });
    }
}

/// Runs `worker` on its own thread. Whatever way it ends, one
/// [`WorkerExit`] is sent on `exits`.
pub fn spawn_worker(
    mut worker: Box<dyn Worker>,
    exits: Sender<WorkerExit>,
) -> Result<JoinHandle<()>, AgentError> {
    let name = worker.name();
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let mut reporter = ExitReporter {
                name,
                outcome: None,
                exits,
            };
            info!("[{name}] starting.");
            let outcome = match worker.run() {
                Ok(()) => Outcome::Returned,
                Err(e) => {
                    error!("[{name}] {e}");
                    Outcome::Failed(e.to_string())
                }
            };
            info!("[{name}] terminated ({outcome}).");
            reporter.outcome = Some(outcome);
        })
        .map_err(|source| AgentError::Spawn {
            name: name.to_owned(),
            source,
        })
}
