#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod dispatch;
pub mod server;
pub mod socket;
pub mod state;
pub mod telemetry;
