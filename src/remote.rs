//! Talking to the control plane.
//!
//! Four calls make up the whole boundary: a health check, the task list, the
//! event stream and the upload endpoint. They sit behind [`RemoteApi`] so the
//! workers can be driven by a fake in tests; [`HttpRemote`] is the real thing
//! on top of a blocking `reqwest` client.

use crate::model::Configuration;

use flate2::{write::GzEncoder, Compression};
use log::debug;
use reqwest::{
    blocking::{multipart, Client, Response},
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL},
    redirect,
};
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::Path,
    time::Duration,
};
use thiserror::Error;

/// Sent with every request.
pub const USER_AGENT: &str = "astronomer/1.0";

/// Redirects followed before a request is treated as failed.
const MAX_REDIRECTS: usize = 5;

/// Things that go wrong on the way to or from the control plane.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, timeout, redirect loop or body decoding failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with something other than 2xx.
    #[error("{url} answered {status}")]
    Status {
        /// The request URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The device token cannot be put in a header.
    #[error("authorization token is not a valid header value")]
    Token,

    /// Reading a file to upload failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The control-plane calls the workers make.
pub trait RemoteApi: Send {
    /// Succeeds when the control plane is reachable and accepts our token.
    fn health_check(&self) -> Result<(), RemoteError>;

    /// The telescope identity and its full task list.
    fn fetch_configuration(&self) -> Result<Configuration, RemoteError>;

    /// Opens the event stream, asking the server to skip everything up to and
    /// including `last_event_id`.
    fn open_event_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<Box<dyn BufRead + Send>, RemoteError>;

    /// Uploads one file, gzip compressed. Returns the server's JSON
    /// acknowledgement.
    fn upload(&self, path: &Path) -> Result<serde_json::Value, RemoteError>;
}

/// Where each call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub health_check: String,
    pub tasks: String,
    pub events: String,
    pub transmit: String,
}

impl Endpoints {
    /// The URL layout for telescope `telescope_id` under `home_url`.
    pub fn new(home_url: &str, telescope_id: &str) -> Self {
        let home = home_url.trim_end_matches('/');
        Self {
            health_check: format!("{home}/api/telescope/{telescope_id}/health-check"),
            tasks: format!("{home}/api/telescope/{telescope_id}/tasks"),
            events: format!("{home}/api/events/TEL-{telescope_id}"),
            transmit: format!("{home}/api/telescope/{telescope_id}/transmit"),
        }
    }
}

/// [`RemoteApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    endpoints: Endpoints,
    client: Client,
    stream_client: Client,
}

impl HttpRemote {
    /// Every ordinary call gives up after `request_timeout`. The event stream
    /// is allowed to sit idle for `stream_timeout` between reads before it
    /// counts as disconnected.
    pub fn new(
        endpoints: Endpoints,
        token: &str,
        request_timeout: Duration,
        stream_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut auth =
            HeaderValue::from_str(&format!("Device {token}")).map_err(|_| RemoteError::Token)?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let build = |timeout: Duration| {
            Client::builder()
                .user_agent(USER_AGENT)
                .default_headers(headers.clone())
                .redirect(redirect::Policy::limited(MAX_REDIRECTS))
                .connect_timeout(request_timeout)
                .timeout(timeout)
                .build()
        };

        Ok(Self {
            endpoints,
            client: build(request_timeout)?,
            stream_client: build(stream_timeout)?,
        })
    }

    fn check(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::Status {
                url: response.url().to_string(),
                status: status.as_u16(),
            })
        }
    }
}

impl RemoteApi for HttpRemote {
    fn health_check(&self) -> Result<(), RemoteError> {
        debug!("pinging {}", self.endpoints.health_check);
        Self::check(self.client.get(&self.endpoints.health_check).send()?)?;
        Ok(())
    }

    fn fetch_configuration(&self) -> Result<Configuration, RemoteError> {
        let response = Self::check(self.client.get(&self.endpoints.tasks).send()?)?;
        Ok(response.json()?)
    }

    fn open_event_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<Box<dyn BufRead + Send>, RemoteError> {
        let mut request = self
            .stream_client
            .get(&self.endpoints.events)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }
        let response = Self::check(request.send()?)?;
        Ok(Box::new(BufReader::new(response)))
    }

    fn upload(&self, path: &Path) -> Result<serde_json::Value, RemoteError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = multipart::Part::bytes(gzip_file(path)?)
            .file_name(format!("{name}.gz"))
            .mime_str("application/gzip")?;
        let form = multipart::Form::new().part("data", part);

        let response = Self::check(
            self.client
                .post(&self.endpoints.transmit)
                .multipart(form)
                .send()?,
        )?;
        Ok(response.json()?)
    }
}

/// Reads `path` and gzips it in memory.
pub fn gzip_file(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&fs::read(path)?)?;
    encoder.finish()
}
