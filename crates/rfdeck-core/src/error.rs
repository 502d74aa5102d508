use rfdeck_ipc::{DaemonError, Device, ErrorCode, ExitOutcome};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{device} is held by {owner}")]
    DeviceBusy { device: Device, owner: String },

    #[error("{device} unavailable: held by {owner}")]
    DeviceUnavailable { device: Device, owner: String },

    #[error("{requested_by} does not own {device}")]
    NotOwner {
        device: Device,
        owner: Option<String>,
        requested_by: String,
    },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("process {outcome}")]
    ProcessExited { outcome: ExitOutcome, tail: Vec<String> },

    #[error("already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rfdeck_ipc::UnknownDeviceName> for CoreError {
    fn from(err: rfdeck_ipc::UnknownDeviceName) -> Self {
        CoreError::UnknownDevice(err.0)
    }
}

impl From<CoreError> for DaemonError {
    fn from(err: CoreError) -> Self {
        err.to_daemon_error()
    }
}

impl CoreError {
    pub fn to_daemon_error(&self) -> DaemonError {
        let message = self.to_string();
        match self {
            CoreError::InvalidConfig(_) => DaemonError::new(ErrorCode::BadRequest, message, false),
            CoreError::DeviceBusy { owner, .. } | CoreError::DeviceUnavailable { owner, .. } => {
                DaemonError::new(ErrorCode::Busy, message, true).with_detail(owner.clone())
            }
            CoreError::NotOwner { owner, .. } => {
                let err = DaemonError::new(ErrorCode::Forbidden, message, false);
                match owner {
                    Some(owner) => err.with_detail(format!("held by {owner}")),
                    None => err,
                }
            }
            CoreError::UnknownDevice(_) | CoreError::UnknownTool(_) => {
                DaemonError::new(ErrorCode::NotFound, message, false)
            }
            CoreError::SpawnFailed { reason, .. } => {
                DaemonError::new(ErrorCode::SpawnFailed, message, false).with_detail(reason.clone())
            }
            CoreError::ProcessExited { tail, .. } => {
                let err = DaemonError::new(ErrorCode::ProcessExited, message, false);
                if tail.is_empty() {
                    err
                } else {
                    err.with_detail(tail.join("\n"))
                }
            }
            CoreError::AlreadyRunning => {
                DaemonError::new(ErrorCode::AlreadyRunning, message, false)
            }
            CoreError::Io(err) => {
                DaemonError::new(ErrorCode::Io, message, false).with_detail(format!("{:?}", err))
            }
        }
    }

    pub fn to_daemon_error_with_source(&self, source: &'static str) -> DaemonError {
        self.to_daemon_error().with_source(source)
    }
}
