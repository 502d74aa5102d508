#![cfg(target_os = "linux")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use rfdeck_client::{ClientConfig, DaemonClient};
use rfdeck_daemon::{config::DaemonConfig, server, socket, state::DaemonState};
use rfdeck_ipc::{
    DaemonError, DaemonEvent, Device, ErrorCode, ResponseBody, ResponseEnvelope, SweepConfig,
    SweepState,
};

const SWEEP_SCRIPT: &str = "while true; do \
    echo '2024-03-01, 12:00:00.000001, 433000000, 434000000, 500000.00, 20, -70.0, -65.5'; \
    sleep 0.05; done";

struct TestDaemon {
    _dir: tempfile::TempDir,
    socket_path: std::path::PathBuf,
    state: Arc<DaemonState>,
    shutdown: Arc<Notify>,
    server_task: JoinHandle<()>,
}

impl TestDaemon {
    fn start(tools_json: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("rfdeckd.sock");
        let listener = socket::bind(&socket_path).expect("bind socket");

        let mut config = DaemonConfig::from_env();
        config.socket_path = socket_path.clone();
        config.root_path = dir.path().to_path_buf();
        config.max_requests_per_second = 0;
        config.sweep.program = "sh".to_string();
        config.sweep.base_args = vec![
            "-c".to_string(),
            SWEEP_SCRIPT.to_string(),
            "hackrf_sweep".to_string(),
        ];
        config.sweep.stop_grace = Duration::from_secs(2);
        config.sweep.startup_timeout = Duration::from_secs(5);
        config.tools_file = dir.path().join("tools.json");
        if let Some(json) = tools_json {
            std::fs::write(&config.tools_file, json).expect("write tools");
        }

        let state = Arc::new(DaemonState::new(config).expect("state"));
        let shutdown = Arc::new(Notify::new());
        let server_state = Arc::clone(&state);
        let server_shutdown = Arc::clone(&shutdown);
        let server_task = tokio::spawn(async move {
            server::run(listener, server_state, server_shutdown).await;
        });

        Self {
            _dir: dir,
            socket_path,
            state,
            shutdown,
            server_task,
        }
    }

    async fn client(&self, name: &str) -> DaemonClient {
        connect(&self.socket_path, name).await
    }

    async fn stop(self) {
        self.shutdown.notify_waiters();
        let _ = self.server_task.await;
        self.state.shutdown().await;
    }
}

async fn connect(path: &Path, name: &str) -> DaemonClient {
    DaemonClient::connect_with_config(ClientConfig {
        socket_path: path.to_path_buf(),
        client_name: name.to_string(),
        client_version: "test".to_string(),
        ..Default::default()
    })
    .await
    .expect("connect")
}

fn code_of(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<DaemonError>()
        .map(|e| e.code)
        .unwrap_or_else(|| panic!("not a daemon error: {err:#}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_leases_over_the_socket() {
    let daemon = TestDaemon::start(None).await_ready().await;
    let mut client = daemon.client("lease-test").await;

    let health = client.health().await.expect("health");
    assert!(health.ok);

    let devices = client.device_status().await.expect("status");
    assert_eq!(devices.len(), 3);
    assert!(devices.values().all(|d| d.available && d.owner.is_none()));

    let lease = client
        .device_acquire("alfa", "kismet", Some(4242))
        .await
        .expect("acquire");
    assert_eq!(lease.owner, "kismet");
    assert_eq!(lease.process_id, Some(4242));

    let busy = client.device_acquire("alfa", "wifite", None).await.unwrap_err();
    assert_eq!(code_of(&busy), ErrorCode::Busy);

    let forbidden = client.device_release("alfa", "wifite").await.unwrap_err();
    assert_eq!(code_of(&forbidden), ErrorCode::Forbidden);

    let unknown = client.device_acquire("rtlsdr", "x", None).await.unwrap_err();
    assert_eq!(code_of(&unknown), ErrorCode::NotFound);

    let devices = client.device_status().await.expect("status");
    assert_eq!(devices[&Device::Alfa].owner.as_deref(), Some("kismet"));
    assert!(!devices[&Device::Alfa].available);

    assert!(client.device_force_release("alfa").await.expect("force"));
    assert!(!client.device_force_release("alfa").await.expect("force again"));
    assert!(!client.device_release("alfa", "kismet").await.expect("release"));

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_streams_to_subscribers_and_emergency_stop_frees_hackrf() {
    let daemon = TestDaemon::start(None).await_ready().await;
    let mut control = daemon.client("control").await;

    let (ack, mut events) = daemon
        .client("watcher")
        .await
        .subscribe()
        .await
        .expect("subscribe");
    assert_eq!(ack.status.state, SweepState::Idle);
    assert!(ack.queue_capacity > 0);

    let status = control
        .sweep_start(SweepConfig::new(433_500_000))
        .await
        .expect("start");
    assert_eq!(status.state, SweepState::Starting);

    let sample = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await.expect("event") {
                Some(DaemonEvent::Spectrum(sample)) => break sample,
                Some(_) => continue,
                None => panic!("stream closed"),
            }
        }
    })
    .await
    .expect("no sample pushed");
    assert_eq!(sample.start_freq_hz, 433_000_000);
    assert_eq!(sample.power_bins, vec![-70.0, -65.5]);

    let status = control.sweep_status().await.expect("status");
    assert_eq!(status.state, SweepState::Running);
    assert!(status.process_alive);
    let devices = control.device_status().await.expect("devices");
    assert_eq!(devices[&Device::Hackrf].owner.as_deref(), Some("hackrf-sweep"));

    let busy = control
        .sweep_start(SweepConfig::new(915_000_000))
        .await
        .unwrap_err();
    assert_eq!(code_of(&busy), ErrorCode::AlreadyRunning);

    let status = control.sweep_emergency_stop().await.expect("emergency");
    assert_eq!(status.state, SweepState::Idle);
    let devices = control.device_status().await.expect("devices");
    assert!(devices[&Device::Hackrf].available);

    let info = control.sweep_process_info().await.expect("process info");
    assert!(info.process.is_none());

    let tools = control.tool_list().await.expect("tools");
    assert!(tools.iter().any(|t| t.name == "hackrf-sweep"));

    daemon.stop().await;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = events.next().await {}
    })
    .await;
    assert!(closed.is_ok(), "event stream stayed open after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_tools_share_the_lease_table() {
    let tools = r#"[{"name":"bt-scan","device":"bluetooth","program":"sleep","args":["30"]}]"#;
    let daemon = TestDaemon::start(Some(tools)).await_ready().await;
    let mut client = daemon.client("tools").await;

    let status = client
        .tool_start("bt-scan", serde_json::Value::Null)
        .await
        .expect("start tool");
    assert!(status.pid.is_some());

    let busy = client
        .device_acquire("bluetooth", "someone-else", None)
        .await
        .unwrap_err();
    assert_eq!(code_of(&busy), ErrorCode::Busy);

    let again = client
        .tool_start("bt-scan", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(code_of(&again), ErrorCode::AlreadyRunning);

    let missing = client.tool_status("nope").await.unwrap_err();
    assert_eq!(code_of(&missing), ErrorCode::NotFound);

    client.tool_stop("bt-scan").await.expect("stop tool");
    let devices = client.device_status().await.expect("devices");
    assert!(devices[&Device::Bluetooth].available);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_requests_close_the_connection() {
    let daemon = TestDaemon::start(None).await_ready().await;
    let mut raw = UnixStream::connect(&daemon.socket_path).await.expect("connect");

    let hello = serde_json::json!({
        "protocol_version": rfdeck_ipc::PROTOCOL_VERSION,
        "client_name": "raw",
        "client_version": "0",
        "supports": [],
    });
    write_raw(&mut raw, hello.to_string().as_bytes()).await;
    let ack = read_raw(&mut raw).await.expect("hello ack");
    assert!(ack.get("daemon_version").is_some());

    for _ in 0..3 {
        write_raw(&mut raw, b"{not json").await;
        let reply = read_raw(&mut raw).await.expect("error reply");
        let envelope: ResponseEnvelope = serde_json::from_value(reply).expect("envelope");
        match envelope.body {
            ResponseBody::Err(err) => assert_eq!(err.code, ErrorCode::BadRequest),
            other => panic!("expected error, got {other:?}"),
        }
    }
    assert!(read_raw(&mut raw).await.is_none(), "connection left open");

    daemon.stop().await;
}

impl TestDaemon {
    /// Gives the accept loop a moment to start polling.
    async fn await_ready(self) -> Self {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self
    }
}

async fn write_raw(stream: &mut UnixStream, payload: &[u8]) {
    stream
        .write_all(&rfdeck_ipc::encode_frame(payload))
        .await
        .expect("write frame");
}

async fn read_raw(stream: &mut UnixStream) -> Option<serde_json::Value> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}
