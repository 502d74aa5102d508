pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME: u32 = 1_048_576;

mod error;
mod model;
mod types;
mod wire;

pub use error::{DaemonError, ErrorCode};
pub use model::{
    Device, DeviceStatus, ExitOutcome, HackrfHealth, HardwareStatus, Lease, OutputLine,
    OutputStream, ProcessInfo, SpectrumSample, SweepConfig, SweepProcessInfo, SweepState,
    SweepStatus, ToolState, ToolStatus, UnknownDeviceName, DEFAULT_BIN_WIDTH_HZ, DEFAULT_SPAN_HZ,
};
pub use types::{
    endpoint_for_body, ClientHello, DaemonEvent, DeviceAcquireRequest, DeviceForceReleaseRequest,
    DeviceReleaseRequest, DeviceReleaseResponse, DeviceStatusResponse, Endpoint, FeatureFlag,
    HealthResponse, HelloAck, LeaseResponse, RequestBody, RequestEnvelope, ResponseBody,
    ResponseEnvelope, ResponseOk, SubscribeAck, SweepStartRequest, ToolListResponse,
    ToolNameRequest, ToolStartRequest, VersionResponse,
};
pub use wire::{decode_frame_length, encode_frame, FrameError};
