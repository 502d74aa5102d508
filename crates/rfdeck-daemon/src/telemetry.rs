use rfdeck_ipc::{Endpoint, ResponseBody};
use tracing::info;

pub fn log_request(request_id: u64, endpoint: Endpoint, duration_ms: u64, response: &ResponseBody) {
    let (result, code) = match response {
        ResponseBody::Ok(_) => ("ok", None),
        ResponseBody::Err(err) => ("error", Some(err.code as u16)),
        ResponseBody::Event(_) => ("event", None),
    };

    info!(
        request_id,
        endpoint = ?endpoint,
        duration_ms,
        result,
        error_code = ?code,
        "request"
    );
}
