//! Runner relay: a coordinator that bridges bus work queues onto runner
//! websocket connections, and the runner that polls it for tasks.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod relay;
pub mod runner;
