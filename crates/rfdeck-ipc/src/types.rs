use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    DaemonError, HackrfHealth, HardwareStatus, Lease, SpectrumSample, SweepConfig,
    SweepProcessInfo, SweepStatus, ToolStatus,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    SweepSubscribe,
    UdsTimeouts,
    ToolManagers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_name: String,
    pub client_version: String,
    pub supports: Vec<FeatureFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub protocol_version: u32,
    pub daemon_version: String,
    pub features: Vec<FeatureFlag>,
    pub max_frame: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Health,
    Version,
    DeviceStatus,
    DeviceAcquire,
    DeviceRelease,
    DeviceForceRelease,
    SweepStart,
    SweepStop,
    SweepEmergencyStop,
    SweepForceCleanup,
    SweepStatus,
    SweepProcessInfo,
    SweepHealth,
    SweepSubscribe,
    ToolList,
    ToolStart,
    ToolStop,
    ToolStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u32,
    pub request_id: u64,
    pub endpoint: Endpoint,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RequestBody {
    Health,
    Version,
    DeviceStatus,
    DeviceAcquire(DeviceAcquireRequest),
    DeviceRelease(DeviceReleaseRequest),
    DeviceForceRelease(DeviceForceReleaseRequest),
    SweepStart(SweepStartRequest),
    SweepStop,
    SweepEmergencyStop,
    SweepForceCleanup,
    SweepStatus,
    SweepProcessInfo,
    SweepHealth,
    SweepSubscribe,
    ToolList,
    ToolStart(ToolStartRequest),
    ToolStop(ToolNameRequest),
    ToolStatus(ToolNameRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseBody {
    Ok(ResponseOk),
    Err(DaemonError),
    Event(DaemonEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseOk {
    Health(HealthResponse),
    Version(VersionResponse),
    DeviceStatus(DeviceStatusResponse),
    DeviceAcquired(LeaseResponse),
    DeviceReleased(DeviceReleaseResponse),
    Sweep(SweepStatus),
    SweepProcessInfo(SweepProcessInfo),
    SweepHealth(HackrfHealth),
    SweepSubscribed(SubscribeAck),
    ToolList(ToolListResponse),
    Tool(ToolStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub uptime_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub daemon_version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusResponse {
    pub devices: HardwareStatus,
}

/// Device names stay strings on the wire so unknown names reach the
/// resource manager and come back as `NotFound` instead of a decode error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAcquireRequest {
    pub device: String,
    pub owner: String,
    #[serde(default)]
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReleaseRequest {
    pub device: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceForceReleaseRequest {
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub lease: Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReleaseResponse {
    pub device: String,
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepStartRequest {
    pub config: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeAck {
    pub queue_capacity: usize,
    pub status: SweepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStartRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DaemonEvent {
    Spectrum(SpectrumSample),
    SweepStatus(SweepStatus),
    SubscriberLagged { dropped: u64 },
}

pub fn endpoint_for_body(body: &RequestBody) -> Endpoint {
    match body {
        RequestBody::Health => Endpoint::Health,
        RequestBody::Version => Endpoint::Version,
        RequestBody::DeviceStatus => Endpoint::DeviceStatus,
        RequestBody::DeviceAcquire(_) => Endpoint::DeviceAcquire,
        RequestBody::DeviceRelease(_) => Endpoint::DeviceRelease,
        RequestBody::DeviceForceRelease(_) => Endpoint::DeviceForceRelease,
        RequestBody::SweepStart(_) => Endpoint::SweepStart,
        RequestBody::SweepStop => Endpoint::SweepStop,
        RequestBody::SweepEmergencyStop => Endpoint::SweepEmergencyStop,
        RequestBody::SweepForceCleanup => Endpoint::SweepForceCleanup,
        RequestBody::SweepStatus => Endpoint::SweepStatus,
        RequestBody::SweepProcessInfo => Endpoint::SweepProcessInfo,
        RequestBody::SweepHealth => Endpoint::SweepHealth,
        RequestBody::SweepSubscribe => Endpoint::SweepSubscribe,
        RequestBody::ToolList => Endpoint::ToolList,
        RequestBody::ToolStart(_) => Endpoint::ToolStart,
        RequestBody::ToolStop(_) => Endpoint::ToolStop,
        RequestBody::ToolStatus(_) => Endpoint::ToolStatus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_adjacent_tagging() {
        let body = RequestBody::DeviceForceRelease(DeviceForceReleaseRequest {
            device: "hackrf".to_string(),
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], "DeviceForceRelease");
        assert_eq!(value["data"]["device"], "hackrf");
        assert_eq!(endpoint_for_body(&body), Endpoint::DeviceForceRelease);
    }

    #[test]
    fn unit_requests_decode_without_data() {
        let body: RequestBody = serde_json::from_str(r#"{"type":"SweepEmergencyStop"}"#).unwrap();
        assert_eq!(endpoint_for_body(&body), Endpoint::SweepEmergencyStop);
    }

    #[test]
    fn tool_start_params_default_to_null() {
        let body: RequestBody =
            serde_json::from_str(r#"{"type":"ToolStart","data":{"name":"kismet"}}"#).unwrap();
        match body {
            RequestBody::ToolStart(req) => {
                assert_eq!(req.name, "kismet");
                assert!(req.params.is_null());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
