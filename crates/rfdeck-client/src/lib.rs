mod client;

pub use client::{
    daemon_error, ClientConfig, DaemonClient, DaemonClientInfo, EventStream, DEFAULT_SOCKET_PATH,
};
