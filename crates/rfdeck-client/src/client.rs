use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rfdeck_ipc::{
    endpoint_for_body, ClientHello, DaemonError, DaemonEvent, DeviceAcquireRequest,
    DeviceForceReleaseRequest, DeviceReleaseRequest, DeviceReleaseResponse, FeatureFlag,
    HackrfHealth, HardwareStatus, HealthResponse, HelloAck, Lease, RequestBody, RequestEnvelope,
    ResponseBody, ResponseEnvelope, ResponseOk, SubscribeAck, SweepConfig, SweepProcessInfo,
    SweepStartRequest, SweepStatus, ToolNameRequest, ToolStartRequest, ToolStatus,
    VersionResponse, MAX_FRAME, PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

pub const DEFAULT_SOCKET_PATH: &str = "/run/rfdeck/rfdeckd.sock";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DaemonClientInfo {
    pub daemon_version: String,
    pub protocol_version: u32,
    pub features: Vec<FeatureFlag>,
    pub max_frame: u32,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub client_name: String,
    pub client_version: String,
    pub request_timeout: Duration,
    /// Used for requests that wait on a process, such as a graceful stop.
    pub long_request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_name: "rfdeck-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            long_request_timeout: LONG_REQUEST_TIMEOUT,
            max_retries: MAX_RETRY_ATTEMPTS,
            retry_delay_ms: INITIAL_RETRY_DELAY.as_millis() as u64,
        }
    }
}

pub struct DaemonClient {
    stream: Option<UnixStream>,
    next_request_id: AtomicU64,
    info: Option<DaemonClientInfo>,
    config: ClientConfig,
}

impl DaemonClient {
    pub async fn connect<P: AsRef<Path>>(
        path: P,
        client_name: &str,
        client_version: &str,
    ) -> Result<Self> {
        let config = ClientConfig {
            socket_path: path.as_ref().to_path_buf(),
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            ..Default::default()
        };
        Self::connect_with_config(config).await
    }

    pub async fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let mut client = Self::new_disconnected(config);
        client.reconnect().await?;
        Ok(client)
    }

    pub fn new_disconnected(config: ClientConfig) -> Self {
        Self {
            stream: None,
            next_request_id: AtomicU64::new(1),
            info: None,
            config,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let mut stream = match UnixStream::connect(&self.config.socket_path).await {
            Ok(stream) => stream,
            Err(err) => {
                let path = self.config.socket_path.display().to_string();
                return Err(anyhow::Error::new(err)
                    .context(format!("connection to daemon socket at {path} failed")));
            }
        };

        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
            client_version: self.config.client_version.clone(),
            supports: vec![FeatureFlag::SweepSubscribe, FeatureFlag::ToolManagers],
        };
        let hello_bytes = serde_json::to_vec(&hello)?;
        write_frame(&mut stream, &hello_bytes, MAX_FRAME).await?;

        let ack_bytes = timeout(Duration::from_secs(5), read_frame(&mut stream, MAX_FRAME))
            .await
            .context("handshake timed out")??;
        let ack: HelloAck = match serde_json::from_slice(&ack_bytes) {
            Ok(ack) => ack,
            Err(_) => {
                let refused: ResponseEnvelope = serde_json::from_slice(&ack_bytes)
                    .context("unrecognised handshake reply")?;
                match refused.body {
                    ResponseBody::Err(err) => return Err(daemon_error(err)),
                    _ => bail!("unexpected handshake reply"),
                }
            }
        };
        if ack.protocol_version != PROTOCOL_VERSION {
            bail!(
                "protocol mismatch: client={} daemon={}",
                PROTOCOL_VERSION,
                ack.protocol_version
            );
        }

        self.stream = Some(stream);
        self.info = Some(DaemonClientInfo {
            daemon_version: ack.daemon_version,
            protocol_version: ack.protocol_version,
            features: ack.features,
            max_frame: ack.max_frame,
        });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn info(&self) -> Option<&DaemonClientInfo> {
        self.info.as_ref()
    }

    pub async fn ensure_connected(&mut self) -> Result<()> {
        if !self.is_connected() {
            self.reconnect().await?;
        }
        Ok(())
    }

    pub async fn request(&mut self, body: RequestBody) -> Result<ResponseBody> {
        self.request_with_timeout(body, self.config.request_timeout)
            .await
    }

    pub async fn request_long(&mut self, body: RequestBody) -> Result<ResponseBody> {
        self.request_with_timeout(body, self.config.long_request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &mut self,
        body: RequestBody,
        req_timeout: Duration,
    ) -> Result<ResponseBody> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.config.max_retries.max(1) {
            if attempts > 0 {
                let delay = Duration::from_millis(
                    self.config.retry_delay_ms * (1u64 << (attempts - 1).min(4)),
                );
                sleep(delay).await;
            }

            match self.try_request(&body, req_timeout).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let should_retry = is_retryable_error(&err);
                    last_error = Some(err);
                    self.stream = None;

                    if !should_retry {
                        break;
                    }

                    attempts += 1;

                    if attempts < self.config.max_retries {
                        if let Err(e) = self.reconnect().await {
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("request failed with no error")))
    }

    /// Sends a request exactly once. Starts are not idempotent, so an
    /// ambiguous failure such as a timeout must not be replayed.
    pub async fn request_once(
        &mut self,
        body: RequestBody,
        req_timeout: Duration,
    ) -> Result<ResponseBody> {
        let result = self.try_request(&body, req_timeout).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn try_request(
        &mut self,
        body: &RequestBody,
        req_timeout: Duration,
    ) -> Result<ResponseBody> {
        self.ensure_connected().await?;

        let stream = self.stream.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        let info = self.info.as_ref().ok_or_else(|| anyhow!("no info"))?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope {
            v: info.protocol_version,
            request_id,
            endpoint: endpoint_for_body(body),
            body: body.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        write_frame(stream, &payload, info.max_frame).await?;

        let response_bytes = timeout(req_timeout, read_frame(stream, info.max_frame))
            .await
            .context("response timed out")??;
        let response: ResponseEnvelope = serde_json::from_slice(&response_bytes)?;
        if response.request_id != request_id {
            // The daemon answers an idle or broken connection with a request-less
            // error and closes it.
            if let ResponseBody::Err(err) = response.body {
                bail!("connection closed by daemon: {}", err);
            }
            bail!(
                "response request_id mismatch: expected {} got {}",
                request_id,
                response.request_id
            );
        }
        if response.v != info.protocol_version {
            bail!(
                "protocol version mismatch: expected {} got {}",
                info.protocol_version,
                response.v
            );
        }
        Ok(response.body)
    }

    pub async fn health(&mut self) -> Result<HealthResponse> {
        match self.request(RequestBody::Health).await? {
            ResponseBody::Ok(ResponseOk::Health(resp)) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn version(&mut self) -> Result<VersionResponse> {
        match self.request(RequestBody::Version).await? {
            ResponseBody::Ok(ResponseOk::Version(resp)) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn device_status(&mut self) -> Result<HardwareStatus> {
        match self.request(RequestBody::DeviceStatus).await? {
            ResponseBody::Ok(ResponseOk::DeviceStatus(resp)) => Ok(resp.devices),
            other => Err(unexpected(other)),
        }
    }

    pub async fn device_acquire(
        &mut self,
        device: &str,
        owner: &str,
        process_id: Option<u32>,
    ) -> Result<Lease> {
        let body = RequestBody::DeviceAcquire(DeviceAcquireRequest {
            device: device.to_string(),
            owner: owner.to_string(),
            process_id,
        });
        match self.request(body).await? {
            ResponseBody::Ok(ResponseOk::DeviceAcquired(resp)) => Ok(resp.lease),
            other => Err(unexpected(other)),
        }
    }

    pub async fn device_release(&mut self, device: &str, owner: &str) -> Result<bool> {
        let body = RequestBody::DeviceRelease(DeviceReleaseRequest {
            device: device.to_string(),
            owner: owner.to_string(),
        });
        match self.request(body).await? {
            ResponseBody::Ok(ResponseOk::DeviceReleased(DeviceReleaseResponse {
                released, ..
            })) => Ok(released),
            other => Err(unexpected(other)),
        }
    }

    pub async fn device_force_release(&mut self, device: &str) -> Result<bool> {
        let body = RequestBody::DeviceForceRelease(DeviceForceReleaseRequest {
            device: device.to_string(),
        });
        match self.request(body).await? {
            ResponseBody::Ok(ResponseOk::DeviceReleased(DeviceReleaseResponse {
                released, ..
            })) => Ok(released),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sweep_start(&mut self, config: SweepConfig) -> Result<SweepStatus> {
        let body = RequestBody::SweepStart(SweepStartRequest { config });
        let response = self
            .request_once(body, self.config.long_request_timeout)
            .await?;
        match response {
            ResponseBody::Ok(ResponseOk::Sweep(status)) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sweep_stop(&mut self) -> Result<SweepStatus> {
        self.sweep_request(RequestBody::SweepStop, true).await
    }

    pub async fn sweep_emergency_stop(&mut self) -> Result<SweepStatus> {
        self.sweep_request(RequestBody::SweepEmergencyStop, false)
            .await
    }

    pub async fn sweep_force_cleanup(&mut self) -> Result<SweepStatus> {
        self.sweep_request(RequestBody::SweepForceCleanup, false)
            .await
    }

    pub async fn sweep_status(&mut self) -> Result<SweepStatus> {
        self.sweep_request(RequestBody::SweepStatus, false).await
    }

    pub async fn sweep_process_info(&mut self) -> Result<SweepProcessInfo> {
        match self.request(RequestBody::SweepProcessInfo).await? {
            ResponseBody::Ok(ResponseOk::SweepProcessInfo(info)) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sweep_health(&mut self) -> Result<HackrfHealth> {
        match self.request(RequestBody::SweepHealth).await? {
            ResponseBody::Ok(ResponseOk::SweepHealth(health)) => Ok(health),
            other => Err(unexpected(other)),
        }
    }

    async fn sweep_request(&mut self, body: RequestBody, long: bool) -> Result<SweepStatus> {
        let response = if long {
            self.request_long(body).await?
        } else {
            self.request(body).await?
        };
        match response {
            ResponseBody::Ok(ResponseOk::Sweep(status)) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn tool_list(&mut self) -> Result<Vec<ToolStatus>> {
        match self.request(RequestBody::ToolList).await? {
            ResponseBody::Ok(ResponseOk::ToolList(resp)) => Ok(resp.tools),
            other => Err(unexpected(other)),
        }
    }

    pub async fn tool_start(&mut self, name: &str, params: Value) -> Result<ToolStatus> {
        let body = RequestBody::ToolStart(ToolStartRequest {
            name: name.to_string(),
            params,
        });
        match self
            .request_once(body, self.config.long_request_timeout)
            .await?
        {
            ResponseBody::Ok(ResponseOk::Tool(status)) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn tool_stop(&mut self, name: &str) -> Result<ToolStatus> {
        let body = RequestBody::ToolStop(ToolNameRequest {
            name: name.to_string(),
        });
        match self.request_long(body).await? {
            ResponseBody::Ok(ResponseOk::Tool(status)) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn tool_status(&mut self, name: &str) -> Result<ToolStatus> {
        let body = RequestBody::ToolStatus(ToolNameRequest {
            name: name.to_string(),
        });
        match self.request(body).await? {
            ResponseBody::Ok(ResponseOk::Tool(status)) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Turns this connection into a push stream of sweep events.
    pub async fn subscribe(mut self) -> Result<(SubscribeAck, EventStream)> {
        let ack = match self.request(RequestBody::SweepSubscribe).await? {
            ResponseBody::Ok(ResponseOk::SweepSubscribed(ack)) => ack,
            other => return Err(unexpected(other)),
        };
        let max_frame = self.info.as_ref().map(|i| i.max_frame).unwrap_or(MAX_FRAME);
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("connection lost after subscribe"))?;
        Ok((ack, EventStream { stream, max_frame }))
    }
}

/// Sweep events pushed by the daemon after a subscribe.
pub struct EventStream {
    stream: UnixStream,
    max_frame: u32,
}

impl EventStream {
    /// Next event, or `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<DaemonEvent>> {
        let bytes = match read_frame(&mut self.stream, self.max_frame).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let eof = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
                return if eof { Ok(None) } else { Err(err) };
            }
        };
        let envelope: ResponseEnvelope = serde_json::from_slice(&bytes)?;
        match envelope.body {
            ResponseBody::Event(event) => Ok(Some(event)),
            ResponseBody::Err(err) => Err(daemon_error(err)),
            ResponseBody::Ok(_) => Err(anyhow!("unexpected response on event stream")),
        }
    }
}

fn unexpected(body: ResponseBody) -> anyhow::Error {
    match body {
        ResponseBody::Err(err) => daemon_error(err),
        _ => anyhow!("unexpected response body"),
    }
}

/// Wraps a daemon error so callers can still downcast to the typed error.
pub fn daemon_error(err: DaemonError) -> anyhow::Error {
    let code = err.code.to_string();
    let retryable = err.retryable;
    let wrapped = anyhow::Error::new(err);
    if retryable {
        wrapped.context(format!("{code} (retryable)"))
    } else {
        wrapped.context(code)
    }
}

fn is_retryable_error(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<DaemonError>().is_some() {
        return false;
    }
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );
    }
    let text = err.to_string();
    text.contains("timed out") || text.contains("connection")
}

async fn read_frame(stream: &mut UnixStream, max_frame: u32) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = rfdeck_ipc::decode_frame_length(len_buf, max_frame)
        .map_err(|err| anyhow!("invalid frame length: {:?}", err))?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8], max_frame: u32) -> Result<()> {
    if payload.is_empty() {
        bail!("empty payload");
    }
    if payload.len() as u32 > max_frame {
        bail!("payload exceeds max_frame");
    }
    let frame = rfdeck_ipc::encode_frame(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfdeck_ipc::ErrorCode;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn daemon_errors_are_not_retried_and_stay_typed() {
        let err = daemon_error(
            DaemonError::new(ErrorCode::Busy, "device hackrf is busy", true).with_detail("pagermon"),
        );
        assert!(!is_retryable_error(&err));
        let typed = err.downcast_ref::<DaemonError>().unwrap();
        assert_eq!(typed.code, ErrorCode::Busy);
        assert_eq!(err.to_string(), "busy (retryable)");
        assert!(format!("{err:#}").contains("device hackrf is busy (pagermon)"));
    }

    #[test]
    fn transport_errors_are_retried() {
        let io = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(is_retryable_error(&io));
        assert!(is_retryable_error(&anyhow!("response timed out")));
        assert!(!is_retryable_error(&anyhow!("payload exceeds max_frame")));
    }

    /// Completes handshakes, counts requests, never answers them.
    fn silent_daemon(path: &Path) -> Arc<AtomicUsize> {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    if read_frame(&mut stream, MAX_FRAME).await.is_err() {
                        return;
                    }
                    let ack = HelloAck {
                        protocol_version: PROTOCOL_VERSION,
                        daemon_version: "test".to_string(),
                        features: Vec::new(),
                        max_frame: MAX_FRAME,
                    };
                    let ack = serde_json::to_vec(&ack).unwrap();
                    write_frame(&mut stream, &ack, MAX_FRAME).await.unwrap();
                    while read_frame(&mut stream, MAX_FRAME).await.is_ok() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        received
    }

    #[tokio::test]
    async fn starts_are_sent_once_but_reads_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let received = silent_daemon(&path);

        let mut client = DaemonClient::connect_with_config(ClientConfig {
            socket_path: path,
            request_timeout: Duration::from_millis(200),
            long_request_timeout: Duration::from_millis(200),
            max_retries: 3,
            retry_delay_ms: 10,
            ..Default::default()
        })
        .await
        .unwrap();

        let err = client
            .sweep_start(SweepConfig::new(433_500_000))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err:#}");
        assert!(!client.is_connected());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        assert!(client.tool_start("bt-scan", Value::Null).await.is_err());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);

        assert!(client.sweep_status().await.is_err());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let err = match DaemonClient::connect(&path, "test", "0").await {
            Ok(_) => panic!("connected to a missing socket"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("absent.sock"));
    }
}
