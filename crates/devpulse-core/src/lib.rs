//! Core of the devpulse telemetry daemon: socket IPC, the in-process bus,
//! retry persistence and the timer services around them.

pub mod bus;
pub mod ccinfo;
pub mod circuit;
pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod git;
pub mod ipc;
pub mod lifecycle;
pub mod model;
pub mod remote;
pub mod resync;
pub mod retry_queue;
pub mod terminal;
