//! The downlink worker keeps the local task store in step with the control
//! plane.
//!
//! Every connection goes `Disconnected -> Configuring -> Streaming` and back
//! to `Disconnected` when the stream fails or ends. Configuring fetches the
//! full task list and replaces the store with it, so anything missed while
//! offline is healed on reconnect. Streaming follows the event stream from
//! the last event id we remember, applying each command as it arrives.
//! Reconnects happen after a fixed delay, forever.

use crate::error::AgentError;
use crate::event_stream::{EventReader, StreamError, StreamEvent};
use crate::model::{Task, TaskRef};
use crate::remote::{RemoteApi, RemoteError};
use crate::status::{StatusChannel, StatusSender};
use crate::store::{StoreError, TaskStore};
use crate::worker::Worker;

use log::{debug, error, info, warn};
use serde_json::Value;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Event ids the server sends when it could not number an event. Never
/// remembered.
const ERROR_EVENT_ID: &str = "error";

/// Where the link currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Between connections.
    Disconnected,
    /// Fetching the full task list.
    Configuring,
    /// Following the event stream.
    Streaming,
}

/// A command carried in the `data` of a stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkCommand {
    /// Check the control plane is still reachable.
    Ping,
    /// Resync the whole store.
    Configure,
    /// Insert a task the store does not have yet.
    AddTask(Task),
    /// Replace an existing task.
    UpdateTask(Task),
    /// Remove a task by id.
    DeleteTask { id: String },
    /// A `type` we do not know; logged and ignored.
    Unknown(String),
}

/// Failures while acting on a single event. None of them end the stream.
#[derive(Debug, Error)]
pub enum EventError {
    /// The `data` is not the JSON we expect.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The `data` names no command.
    #[error("payload has no `type`")]
    MissingType,

    /// A ping or configure could not reach the control plane.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The store refused the change.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DownlinkCommand {
    /// Parses the JSON `data` of a message event.
    pub fn parse(data: &str) -> Result<Self, EventError> {
        let mut payload: Value = serde_json::from_str(data)?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingType)?
            .to_owned();
        let task = payload
            .as_object_mut()
            .and_then(|fields| fields.remove("task"))
            .unwrap_or(Value::Null);

        Ok(match kind.as_str() {
            "ping" => DownlinkCommand::Ping,
            "configure" => DownlinkCommand::Configure,
            "add-task" => DownlinkCommand::AddTask(serde_json::from_value(task)?),
            "update-task" => DownlinkCommand::UpdateTask(serde_json::from_value(task)?),
            "delete-task" => {
                let TaskRef { id } = serde_json::from_value(task)?;
                DownlinkCommand::DeleteTask { id }
            }
            _ => DownlinkCommand::Unknown(kind),
        })
    }
}

/// Applies control-plane events to the task store.
pub struct Downlink<R> {
    remote: R,
    store: TaskStore,
    status: StatusSender,
    reconnect_delay: Duration,
    last_event_id: Option<String>,
    state: LinkState,
}

impl<R: RemoteApi> Downlink<R> {
    /// Picks up the last event id persisted by a previous run, if any.
    pub fn new(
        remote: R,
        store: TaskStore,
        status: StatusSender,
        reconnect_delay: Duration,
    ) -> Result<Self, StoreError> {
        let last_event_id = store.last_event_id()?;
        if let Some(id) = &last_event_id {
            info!("[Downlink] resuming after event {id}");
        }
        Ok(Self {
            remote,
            store,
            status,
            reconnect_delay,
            last_event_id,
            state: LinkState::Disconnected,
        })
    }

    /// Where the link is now.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The id the next connection will resume after.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// The store this downlink writes to.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Replaces the store with the control plane's current configuration.
    pub fn configure<E>(&mut self) -> Result<(), E>
    where
        E: From<RemoteError> + From<StoreError>,
    {
        let configuration = self.remote.fetch_configuration()?;
        self.store
            .replace_all(&configuration.telescope, &configuration.tasks)?;
        info!(
            "[Downlink] configured telescope {} with {} tasks",
            configuration.telescope.name,
            configuration.tasks.len()
        );
        Ok(())
    }

    /// One connection: configure, then follow the stream until it ends.
    /// `Ok` means the server closed the stream cleanly.
    pub fn session(&mut self) -> Result<(), AgentError> {
        self.state = LinkState::Configuring;
        info!("[Downlink] configuring...");
        self.configure::<AgentError>()?;

        info!("[Downlink] streaming events...");
        let stream = self
            .remote
            .open_event_stream(self.last_event_id.as_deref())?;
        self.state = LinkState::Streaming;
        for event in EventReader::new(stream) {
            match event {
                Ok(event) => self.process(event),
                Err(StreamError::Line(line)) => {
                    warn!("[Downlink] skipping unparseable line `{line}`");
                    self.status.flash_error(StatusChannel::Downlink);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// One session under the downlink light, then the reconnect delay.
    /// Failures are logged and flashed; the next attempt starts afresh.
    pub fn attempt(&mut self) {
        {
            let light = self.status.managed(StatusChannel::Downlink);
            match self.session() {
                Ok(()) => info!("[Downlink] stream closed by host"),
                Err(e) => {
                    warn!("[Downlink] downlink error: {e}");
                    light.error();
                }
            }
        }
        self.state = LinkState::Disconnected;
        thread::sleep(self.reconnect_delay);
    }

    /// Dispatches one event and, if that went well, remembers its id.
    pub fn process(&mut self, event: StreamEvent) {
        info!(
            "[Downlink] event detected: type={:?}, id={:?}",
            event.event, event.id
        );
        let handled = if event.is_message() {
            self.dispatch(&event.data)
        } else {
            debug!("[Downlink] ignoring non-message event");
            Ok(())
        };

        match handled {
            Ok(()) => self.remember(event.id.as_deref()),
            Err(e) => {
                error!("[Downlink] error handling event: {e}");
                self.status.flash_error(StatusChannel::Downlink);
            }
        }
    }

    fn dispatch(&mut self, data: &str) -> Result<(), EventError> {
        match DownlinkCommand::parse(data)? {
            DownlinkCommand::Ping => self.remote.health_check()?,
            DownlinkCommand::Configure => self.configure::<EventError>()?,
            DownlinkCommand::AddTask(task) => {
                self.store.insert_task(&task)?;
                info!("[Downlink] added task {}", task.id);
            }
            DownlinkCommand::UpdateTask(task) => {
                if !self.store.update_task(&task)? {
                    warn!("[Downlink] update for unknown task {}", task.id);
                }
            }
            DownlinkCommand::DeleteTask { id } => {
                if self.store.delete_task(&id)? {
                    info!("[Downlink] deleted task {id}");
                } else {
                    warn!("[Downlink] delete for unknown task {id}");
                }
            }
            DownlinkCommand::Unknown(kind) => warn!("[Downlink] unknown event type `{kind}`"),
        }
        Ok(())
    }

    fn remember(&mut self, id: Option<&str>) {
        let Some(id) = id.filter(|id| !id.is_empty() && *id != ERROR_EVENT_ID) else {
            return;
        };
        self.last_event_id = Some(id.to_owned());
        if let Err(e) = self.store.set_last_event_id(id) {
            warn!("[Downlink] unable to persist event id {id}: {e}");
        }
    }
}

impl<R: RemoteApi> Worker for Downlink<R> {
    fn name(&self) -> &'static str {
        "Downlink"
    }

    fn run(&mut self) -> Result<(), AgentError> {
        info!("[Downlink] beginning downlink from host...");
        loop {
            self.attempt();
            warn!("[Downlink] attempting reconnect...");
        }
    }
}
