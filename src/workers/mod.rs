//! The agent's long-running loops, one [`Worker`](crate::worker::Worker)
//! each.

pub mod downlink;
pub mod indicator;
pub mod logging;
pub mod spectrum;
pub mod transmit;
pub mod watch_sky;
