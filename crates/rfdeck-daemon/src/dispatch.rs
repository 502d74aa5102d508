use std::sync::Arc;
use std::time::Instant;

use rfdeck_core::CoreError;
use rfdeck_ipc::{
    DaemonError, DeviceAcquireRequest, DeviceReleaseResponse, DeviceStatusResponse,
    HealthResponse, LeaseResponse, RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope,
    ResponseOk, SubscribeAck, ToolListResponse, VersionResponse, PROTOCOL_VERSION,
};

use crate::state::DaemonState;
use crate::telemetry::log_request;

fn core_err(source: &'static str) -> impl Fn(CoreError) -> DaemonError {
    move |err| err.to_daemon_error_with_source(source)
}

fn respond(result: Result<ResponseOk, DaemonError>) -> ResponseBody {
    match result {
        Ok(ok) => ResponseBody::Ok(ok),
        Err(err) => ResponseBody::Err(err),
    }
}

fn acquire(state: &DaemonState, req: DeviceAcquireRequest) -> Result<ResponseOk, DaemonError> {
    let source = "daemon.dispatch.device_acquire";
    let resources = &state.resources;
    let device = resources
        .registry()
        .resolve(&req.device)
        .map_err(core_err(source))?;
    let mut lease = resources
        .acquire(device, &req.owner)
        .map_err(core_err(source))?;
    if let Some(pid) = req.process_id {
        resources
            .attach_process(device, &req.owner, pid)
            .map_err(core_err(source))?;
        lease.process_id = Some(pid);
    }
    Ok(ResponseOk::DeviceAcquired(LeaseResponse { lease }))
}

pub async fn handle_request(state: &Arc<DaemonState>, request: RequestEnvelope) -> ResponseEnvelope {
    let start = Instant::now();

    let response_body = match request.body {
        RequestBody::Health => ResponseBody::Ok(ResponseOk::Health(HealthResponse {
            ok: true,
            uptime_ms: state.uptime_ms(),
            message: "ok".to_string(),
        })),
        RequestBody::Version => ResponseBody::Ok(ResponseOk::Version(VersionResponse {
            daemon_version: state.version.clone(),
            protocol_version: PROTOCOL_VERSION,
        })),
        RequestBody::DeviceStatus => {
            ResponseBody::Ok(ResponseOk::DeviceStatus(DeviceStatusResponse {
                devices: state.resources.status(),
            }))
        }
        RequestBody::DeviceAcquire(req) => respond(acquire(state, req)),
        RequestBody::DeviceRelease(req) => {
            let source = "daemon.dispatch.device_release";
            let result = state
                .resources
                .registry()
                .resolve(&req.device)
                .and_then(|device| state.resources.release(device, &req.owner))
                .map(|released| {
                    ResponseOk::DeviceReleased(DeviceReleaseResponse {
                        device: req.device.clone(),
                        released,
                    })
                })
                .map_err(core_err(source));
            respond(result)
        }
        RequestBody::DeviceForceRelease(req) => {
            let source = "daemon.dispatch.device_force_release";
            let result = state
                .resources
                .registry()
                .resolve(&req.device)
                .and_then(|device| state.resources.force_release(device))
                .map(|previous| {
                    ResponseOk::DeviceReleased(DeviceReleaseResponse {
                        device: req.device.clone(),
                        released: previous.is_some(),
                    })
                })
                .map_err(core_err(source));
            respond(result)
        }
        RequestBody::SweepStart(req) => respond(
            state
                .sweep
                .start(req.config)
                .await
                .map(ResponseOk::Sweep)
                .map_err(core_err("daemon.dispatch.sweep_start")),
        ),
        RequestBody::SweepStop => respond(
            state
                .sweep
                .stop_sweep()
                .await
                .map(ResponseOk::Sweep)
                .map_err(core_err("daemon.dispatch.sweep_stop")),
        ),
        RequestBody::SweepEmergencyStop => {
            ResponseBody::Ok(ResponseOk::Sweep(state.sweep.emergency_stop().await))
        }
        RequestBody::SweepForceCleanup => {
            ResponseBody::Ok(ResponseOk::Sweep(state.sweep.force_cleanup().await))
        }
        RequestBody::SweepStatus => ResponseBody::Ok(ResponseOk::Sweep(state.sweep.get_status())),
        RequestBody::SweepProcessInfo => {
            ResponseBody::Ok(ResponseOk::SweepProcessInfo(state.sweep.get_process_info()))
        }
        RequestBody::SweepHealth => {
            ResponseBody::Ok(ResponseOk::SweepHealth(state.sweep.check_health().await))
        }
        // The server attaches the subscription; this is only the acknowledgement.
        RequestBody::SweepSubscribe => ResponseBody::Ok(ResponseOk::SweepSubscribed(SubscribeAck {
            queue_capacity: state.sweep.subscriber_capacity(),
            status: state.sweep.get_status(),
        })),
        RequestBody::ToolList => ResponseBody::Ok(ResponseOk::ToolList(ToolListResponse {
            tools: state.tools.statuses().await,
        })),
        RequestBody::ToolStart(req) => {
            let source = "daemon.dispatch.tool_start";
            let result = match state.tools.get(&req.name) {
                Ok(tool) => tool.start(req.params).await.map(ResponseOk::Tool),
                Err(err) => Err(err),
            };
            respond(result.map_err(core_err(source)))
        }
        RequestBody::ToolStop(req) => {
            let source = "daemon.dispatch.tool_stop";
            let result = match state.tools.get(&req.name) {
                Ok(tool) => match tool.stop().await {
                    Ok(()) => Ok(ResponseOk::Tool(tool.status().await)),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            respond(result.map_err(core_err(source)))
        }
        RequestBody::ToolStatus(req) => {
            let source = "daemon.dispatch.tool_status";
            let result = match state.tools.get(&req.name) {
                Ok(tool) => Ok(ResponseOk::Tool(tool.status().await)),
                Err(err) => Err(err),
            };
            respond(result.map_err(core_err(source)))
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    log_request(request.request_id, request.endpoint, duration_ms, &response_body);

    ResponseEnvelope {
        v: PROTOCOL_VERSION,
        request_id: request.request_id,
        body: response_body,
    }
}
