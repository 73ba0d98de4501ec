//! Astronomer is the field agent of a small radio telescope. It keeps a
//! local copy of the observation schedule in step with a remote control
//! plane, takes IQ captures from an RTL-SDR for every task whose window is
//! open, turns them into calibrated and time-integrated power spectra, and
//! uploads the results home.
//!
//! The agent is a handful of [workers](workers), each on its own thread,
//! that talk only through the [log channel](logger), the [status
//! channel](status) and two shared [flags](status::Flags). The
//! [supervisor] starts them after the radio passes its self-test and stops
//! the agent when any one of them exits.

#![warn(missing_docs)]
pub mod args;
pub mod capture_file;
pub mod error;
pub mod event_stream;
pub mod fixed_buffer;
pub mod logger;
pub mod model;
pub mod plot;
pub mod radio;
pub mod remote;
pub mod rtl_sdr;
pub mod simulated_radio;
pub mod spectrum;
pub mod spectrum_file;
pub mod status;
pub mod status_light;
pub mod store;
pub mod supervisor;
pub mod worker;
pub mod workers;
