use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rfdeck_ipc::{
    Device, DeviceStatus, ExitOutcome, HackrfHealth, OutputStream, ProcessInfo, SpectrumSample,
    SweepConfig, SweepProcessInfo, SweepState, SweepStatus, ToolState, ToolStatus,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::config::{validate, SweepSettings};
use super::hub::{SubscriberHub, Subscription, SweepEvent};
use super::parser::{parse_line, ParsedLine};
use super::probe::probe_hackrf;
use crate::device::{ResourceEvent, ResourceManager};
use crate::error::{CoreError, Result};
use crate::supervisor::{ProcessSpec, ProcessSupervisor};
use crate::tool::ToolManager;

const DEVICE: Device = Device::Hackrf;
const ERROR_TAIL_LINES: usize = 5;

#[derive(Default)]
struct Core {
    state: SweepState,
    /// Bumped by every start and emergency stop; background work tagged with
    /// an older session must not touch state.
    session: u64,
    config: Option<SweepConfig>,
    started_at: Option<DateTime<Utc>>,
    last_sample: Option<Arc<SpectrumSample>>,
    last_sample_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    samples_received: u64,
    malformed_frames: u64,
    ignored_lines: u64,
    consecutive_failures: u32,
    process: Option<Arc<ProcessSupervisor>>,
    pending_kill: Option<Arc<ProcessSupervisor>>,
}

struct Inner {
    settings: SweepSettings,
    resources: Arc<ResourceManager>,
    hub: SubscriberHub,
    core: Mutex<Core>,
    control: tokio::sync::Mutex<()>,
}

/// State machine over one HackRF sweep capture.
///
/// Status reads only take a short synchronous lock and never wait on the
/// capture process. `stop_sweep` calls are serialized; `emergency_stop`
/// never waits behind them.
#[derive(Clone)]
pub struct SweepManager {
    inner: Arc<Inner>,
}

enum LineOutcome {
    Sample,
    FirstSample,
    Other,
    Stale,
}

impl SweepManager {
    pub fn new(settings: SweepSettings, resources: Arc<ResourceManager>) -> Self {
        let hub = SubscriberHub::new(settings.subscriber_capacity);
        Self {
            inner: Arc::new(Inner {
                settings,
                resources,
                hub,
                core: Mutex::new(Core::default()),
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.inner.settings
    }

    pub fn owner(&self) -> &str {
        &self.inner.settings.owner
    }

    /// Validates, takes the device lease and spawns the capture process.
    pub async fn start(&self, config: SweepConfig) -> Result<SweepStatus> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if !matches!(core.state, SweepState::Idle | SweepState::Error) {
            return Err(CoreError::AlreadyRunning);
        }

        let plan = validate(&config)?;

        if core.state == SweepState::Error {
            inner.discard_process(&mut core);
            inner.release_lease();
            core.state = SweepState::Idle;
        }
        if core.pending_kill.as_ref().is_some_and(|p| !p.is_alive()) {
            core.pending_kill = None;
        }

        // Subscribe before acquiring so a force release is never missed.
        let resource_events = inner.resources.subscribe();
        match inner.resources.acquire(DEVICE, &inner.settings.owner) {
            Ok(_) => {}
            Err(CoreError::DeviceBusy { device, owner }) => {
                info!(target: "rfdeck::sweep", holder = %owner, "start refused, device busy");
                return Err(CoreError::DeviceUnavailable { device, owner });
            }
            Err(err) => return Err(err),
        }

        core.session += 1;
        let session = core.session;
        core.state = SweepState::Starting;
        core.config = Some(config.clone());
        core.started_at = Some(Utc::now());
        core.last_error = None;
        core.samples_received = 0;
        core.malformed_frames = 0;
        core.ignored_lines = 0;
        core.consecutive_failures = 0;

        let mut args = inner.settings.base_args.clone();
        args.extend(plan.args());
        let spec = ProcessSpec::new(inner.settings.program.clone(), args);

        let process = match ProcessSupervisor::spawn(spec) {
            Ok(process) => Arc::new(process),
            Err(err) => {
                let err = CoreError::from(err);
                error!(target: "rfdeck::sweep", error = %err, "capture process failed to start");
                inner.release_lease();
                core.state = SweepState::Error;
                core.last_error = Some(err.to_string());
                inner.publish_status(&core);
                return Err(err);
            }
        };

        if let Some(pid) = process.pid() {
            if let Err(err) = inner.resources.attach_process(DEVICE, &inner.settings.owner, pid) {
                debug!(target: "rfdeck::sweep", error = %err, "could not record pid on lease");
            }
        }
        let lines = process.take_lines()?;
        core.process = Some(Arc::clone(&process));

        info!(
            target: "rfdeck::sweep",
            session,
            center_freq_hz = config.center_freq_hz,
            span_hz = config.span_hz,
            pid = ?process.pid(),
            "sweep starting"
        );
        inner.publish_status(&core);
        let status = inner.snapshot(&core);
        drop(core);

        tokio::spawn(read_frames(
            Arc::clone(inner),
            session,
            process,
            lines,
            resource_events,
        ));
        Ok(status)
    }

    /// Graceful stop: terminate with the configured grace, release the lease,
    /// return to `Idle`. From `ErrorState` this is a reset.
    pub async fn stop_sweep(&self) -> Result<SweepStatus> {
        let inner = &self.inner;
        let _control = inner.control.lock().await;

        let (session, process) = {
            let mut core = inner.lock();
            match core.state {
                SweepState::Idle | SweepState::Stopping | SweepState::EmergencyStopping => {
                    return Ok(inner.snapshot(&core));
                }
                SweepState::Error => {
                    inner.discard_process(&mut core);
                    inner.release_lease();
                    core.state = SweepState::Idle;
                    info!(target: "rfdeck::sweep", "error state cleared");
                    inner.publish_status(&core);
                    return Ok(inner.snapshot(&core));
                }
                SweepState::Starting | SweepState::Running => {
                    core.state = SweepState::Stopping;
                    inner.publish_status(&core);
                    (core.session, core.process.clone())
                }
            }
        };

        info!(target: "rfdeck::sweep", session, "sweep stopping");
        if let Some(process) = &process {
            let outcome = process.stop(inner.settings.stop_grace).await;
            info!(target: "rfdeck::sweep", session, outcome = %outcome, "capture process stopped");
        }

        let mut core = inner.lock();
        if core.session != session {
            // An emergency stop finished the job while we were waiting.
            return Ok(inner.snapshot(&core));
        }
        core.process = None;
        inner.release_lease();
        core.state = SweepState::Idle;
        inner.publish_status(&core);
        Ok(inner.snapshot(&core))
    }

    /// Kills the capture process and frees the device without waiting on
    /// anything. Never fails.
    pub async fn emergency_stop(&self) -> SweepStatus {
        let inner = &self.inner;
        let mut core = inner.lock();
        let previous = core.state;
        core.session += 1;
        core.state = SweepState::EmergencyStopping;
        inner.publish_status(&core);

        let killed = inner.kill_current(&mut core);
        if let Err(err) = inner.resources.force_release(DEVICE) {
            error!(target: "rfdeck::sweep", error = %err, "force release failed");
        }
        core.state = SweepState::Idle;
        warn!(
            target: "rfdeck::sweep",
            previous = %previous,
            killed = killed.is_some(),
            "emergency stop"
        );
        inner.publish_status(&core);
        let status = inner.snapshot(&core);
        drop(core);

        if let Some(process) = killed {
            tokio::spawn(confirm_kill(Arc::clone(inner), process));
        }
        status
    }

    /// Emergency stop plus a full reset of counters, last sample, last error
    /// and every subscriber backlog.
    pub async fn force_cleanup(&self) -> SweepStatus {
        self.emergency_stop().await;
        let inner = &self.inner;
        let mut core = inner.lock();
        let cleared = inner.hub.clear_backlog();
        core.config = None;
        core.started_at = None;
        core.last_sample = None;
        core.last_sample_at = None;
        core.last_error = None;
        core.samples_received = 0;
        core.malformed_frames = 0;
        core.ignored_lines = 0;
        core.consecutive_failures = 0;
        info!(target: "rfdeck::sweep", cleared_events = cleared, "forced cleanup");
        inner.publish_status(&core);
        inner.snapshot(&core)
    }

    /// Current status. Also notices a lease that was taken away while a
    /// sweep was active and moves to `ErrorState`.
    pub fn get_status(&self) -> SweepStatus {
        let inner = &self.inner;
        let mut core = inner.lock();
        if core.state.is_active() && !inner.holds_lease() {
            let session = core.session;
            inner.fail(&mut core, session, "device lease lost".to_string());
        }
        inner.snapshot(&core)
    }

    pub fn get_process_info(&self) -> SweepProcessInfo {
        let core = self.inner.lock();
        SweepProcessInfo {
            state: core.state,
            session: core.session,
            consecutive_parse_failures: core.consecutive_failures,
            process: core.process.as_ref().map(|p| p.info()),
            pending_kill: core.pending_kill.as_ref().map(|p| p.info()),
        }
    }

    pub fn last_sample(&self) -> Option<Arc<SpectrumSample>> {
        self.inner.lock().last_sample.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.subscribe()
    }

    pub fn subscriber_capacity(&self) -> usize {
        self.inner.hub.capacity()
    }

    /// Probes the device, unless a sweep already holds it.
    pub async fn check_health(&self) -> HackrfHealth {
        let active = self.inner.lock().state.is_active();
        if active {
            return HackrfHealth {
                connected: true,
                device_info: Some("sweep in progress".to_string()),
                error: None,
                checked_at: Utc::now(),
            };
        }
        let settings = &self.inner.settings;
        probe_hackrf(&settings.probe_program, &[], settings.probe_timeout).await
    }

    /// Emergency stop and end every subscription.
    pub async fn shutdown(&self) {
        self.emergency_stop().await;
        self.inner.hub.close();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn holds_lease(&self) -> bool {
        self.resources.owner(DEVICE).as_deref() == Some(self.settings.owner.as_str())
    }

    fn release_lease(&self) {
        match self.resources.release(DEVICE, &self.settings.owner) {
            Ok(_) => {}
            Err(err) => debug!(target: "rfdeck::sweep", error = %err, "lease not released"),
        }
    }

    /// Takes the current process and sends it SIGKILL without waiting.
    fn kill_current(&self, core: &mut Core) -> Option<Arc<ProcessSupervisor>> {
        let process = core.process.take()?;
        if process.is_alive() {
            process.kill();
            core.pending_kill = Some(Arc::clone(&process));
            Some(process)
        } else {
            None
        }
    }

    fn discard_process(&self, core: &mut Core) {
        if let Some(process) = self.kill_current(core) {
            debug!(target: "rfdeck::sweep", pid = ?process.pid(), "killed leftover capture process");
        }
    }

    /// Moves an active session to `ErrorState`, killing its process and
    /// releasing the lease. No-op for stale sessions.
    fn fail(&self, core: &mut Core, session: u64, reason: String) -> bool {
        if core.session != session || !core.state.is_active() {
            return false;
        }
        error!(target: "rfdeck::sweep", session, reason = %reason, "sweep failed");
        self.kill_current(core);
        self.release_lease();
        core.state = SweepState::Error;
        core.last_error = Some(reason);
        self.publish_status(core);
        true
    }

    fn handle_line(&self, session: u64, line: &str) -> LineOutcome {
        let mut core = self.lock();
        if core.session != session || !core.state.is_active() {
            return LineOutcome::Stale;
        }
        match parse_line(line) {
            ParsedLine::Sample(sample) => {
                let sample = Arc::new(sample);
                let now = Utc::now();
                let at = match core.last_sample_at {
                    Some(previous) if previous > now => previous,
                    _ => now,
                };
                core.samples_received += 1;
                core.consecutive_failures = 0;
                core.last_sample = Some(Arc::clone(&sample));
                core.last_sample_at = Some(at);
                self.hub.publish(SweepEvent::Sample(sample));
                if core.state == SweepState::Starting {
                    core.state = SweepState::Running;
                    info!(target: "rfdeck::sweep", session, "sweep running");
                    self.publish_status(&core);
                    return LineOutcome::FirstSample;
                }
                LineOutcome::Sample
            }
            ParsedLine::Ignored => {
                core.ignored_lines += 1;
                LineOutcome::Other
            }
            ParsedLine::Malformed(reason) => {
                core.malformed_frames += 1;
                core.consecutive_failures += 1;
                debug!(
                    target: "rfdeck::sweep",
                    reason = %reason,
                    consecutive = core.consecutive_failures,
                    "malformed frame dropped"
                );
                let limit = self.settings.max_consecutive_parse_failures;
                if limit > 0 && core.consecutive_failures >= limit {
                    let message = format!(
                        "{} consecutive malformed frames (last: {})",
                        core.consecutive_failures, reason
                    );
                    self.fail(&mut core, session, message);
                }
                LineOutcome::Other
            }
        }
    }

    fn on_lease_event(&self, session: u64, event: ResourceEvent) {
        let lease = event.lease();
        if lease.device != DEVICE || lease.owner != self.settings.owner {
            return;
        }
        if matches!(
            event,
            ResourceEvent::Released(_) | ResourceEvent::ForceReleased(_)
        ) {
            let mut core = self.lock();
            self.fail(&mut core, session, "device lease lost".to_string());
        }
    }

    fn on_exit(&self, session: u64, outcome: ExitOutcome, process: &ProcessSupervisor) {
        let mut core = self.lock();
        if core.session != session || !core.state.is_active() {
            return;
        }
        let tail: Vec<String> = process
            .tail()
            .into_iter()
            .rev()
            .take(ERROR_TAIL_LINES)
            .rev()
            .map(|line| match line.stream {
                OutputStream::Stdout => line.text,
                OutputStream::Stderr => format!("stderr: {}", line.text),
            })
            .collect();
        let exited = CoreError::ProcessExited { outcome, tail };
        let reason = match &exited {
            CoreError::ProcessExited { tail, .. } if !tail.is_empty() => {
                format!("capture {}; last output: {}", exited, tail.join(" | "))
            }
            _ => format!("capture {}", exited),
        };
        self.fail(&mut core, session, reason);
    }

    fn publish_status(&self, core: &Core) {
        self.hub.publish(SweepEvent::Status(self.snapshot(core)));
    }

    fn snapshot(&self, core: &Core) -> SweepStatus {
        SweepStatus {
            state: core.state,
            config: core.config.clone(),
            started_at: core.started_at,
            last_sample_at: core.last_sample_at,
            last_error: core.last_error.clone(),
            samples_received: core.samples_received,
            malformed_frames: core.malformed_frames,
            ignored_lines: core.ignored_lines,
            process_alive: core.process.as_ref().is_some_and(|p| p.is_alive()),
            device: self
                .resources
                .device_status(DEVICE)
                .unwrap_or_else(|_| DeviceStatus::free(DEVICE)),
        }
    }
}

async fn read_frames(
    inner: Arc<Inner>,
    session: u64,
    process: Arc<ProcessSupervisor>,
    mut lines: mpsc::Receiver<rfdeck_ipc::OutputLine>,
    mut resource_events: broadcast::Receiver<ResourceEvent>,
) {
    let settings = &inner.settings;
    // Startup deadline until the first sample, then the gap between samples.
    let watchdog = tokio::time::sleep(settings.startup_timeout);
    tokio::pin!(watchdog);
    let mut watching = true;
    let mut awaiting_first = true;
    let mut events_open = true;

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) if line.stream == OutputStream::Stdout => {
                    match inner.handle_line(session, &line.text) {
                        LineOutcome::FirstSample | LineOutcome::Sample => {
                            awaiting_first = false;
                            watching = !settings.data_timeout.is_zero();
                            if watching {
                                watchdog
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + settings.data_timeout);
                            }
                        }
                        LineOutcome::Other | LineOutcome::Stale => {}
                    }
                }
                Some(line) => {
                    debug!(target: "rfdeck::sweep", session, line = %line.text, "stderr");
                }
                None => break,
            },
            _ = &mut watchdog, if watching => {
                watching = false;
                let message = if awaiting_first {
                    format!(
                        "no valid sample within startup timeout ({} ms)",
                        settings.startup_timeout.as_millis()
                    )
                } else {
                    format!("no sample for {} ms", settings.data_timeout.as_millis())
                };
                let mut core = inner.lock();
                inner.fail(&mut core, session, message);
            }
            event = resource_events.recv(), if events_open => match event {
                Ok(event) => inner.on_lease_event(session, event),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !inner.holds_lease() {
                        let mut core = inner.lock();
                        inner.fail(&mut core, session, "device lease lost".to_string());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }
    }

    let outcome = process.wait_exit().await;
    debug!(target: "rfdeck::sweep", session, outcome = %outcome, "capture output closed");
    inner.on_exit(session, outcome, &process);
}

async fn confirm_kill(inner: Arc<Inner>, process: Arc<ProcessSupervisor>) {
    let outcome = process.confirm_kill().await;
    info!(
        target: "rfdeck::sweep",
        pid = ?process.pid(),
        outcome = %outcome,
        "emergency kill confirmed"
    );
    let mut core = inner.lock();
    let confirmed = core
        .pending_kill
        .as_ref()
        .is_some_and(|pending| Arc::ptr_eq(pending, &process));
    if confirmed {
        core.pending_kill = None;
    }
}

fn tool_state(state: SweepState) -> ToolState {
    match state {
        SweepState::Idle => ToolState::Idle,
        SweepState::Starting => ToolState::Starting,
        SweepState::Running => ToolState::Running,
        SweepState::Stopping | SweepState::EmergencyStopping => ToolState::Stopping,
        SweepState::Error => ToolState::Error,
    }
}

#[async_trait]
impl ToolManager for SweepManager {
    fn name(&self) -> &str {
        self.owner()
    }

    fn device(&self) -> Option<Device> {
        Some(DEVICE)
    }

    async fn start(&self, params: Value) -> Result<ToolStatus> {
        let config: SweepConfig = serde_json::from_value(params)
            .map_err(|err| CoreError::InvalidConfig(format!("sweep parameters: {err}")))?;
        SweepManager::start(self, config).await?;
        Ok(ToolManager::status(self).await)
    }

    async fn stop(&self) -> Result<()> {
        self.stop_sweep().await.map(|_| ())
    }

    async fn status(&self) -> ToolStatus {
        let status = self.get_status();
        let process: Option<ProcessInfo> = self.inner.lock().process.as_ref().map(|p| p.info());
        ToolStatus {
            name: self.owner().to_string(),
            device: Some(DEVICE),
            state: tool_state(status.state),
            pid: process.as_ref().and_then(|p| p.pid),
            started_at: status.started_at,
            last_error: status.last_error,
            tail: process.map(|p| p.tail).unwrap_or_default(),
        }
    }
}
