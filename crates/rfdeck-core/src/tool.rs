//! Uniform start/stop/status contract for everything that drives hardware.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rfdeck_ipc::{Device, ToolState, ToolStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::ResourceManager;
use crate::error::{CoreError, Result};
use crate::supervisor::{ProcessSpec, ProcessSupervisor};

/// Every tool acquires its device before spawning anything and releases it
/// on every exit path.
#[async_trait]
pub trait ToolManager: Send + Sync {
    fn name(&self) -> &str;

    fn device(&self) -> Option<Device>;

    async fn start(&self, params: Value) -> Result<ToolStatus>;

    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> ToolStatus;
}

/// One entry of `tools.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub device: Option<Device>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Default)]
struct ToolCore {
    state: ToolState,
    session: u64,
    process: Option<Arc<ProcessSupervisor>>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct ToolInner {
    def: ToolDefinition,
    resources: Arc<ResourceManager>,
    stop_grace: Duration,
    core: Mutex<ToolCore>,
}

/// A tool that is nothing more than a long-running external program bound
/// to one device.
pub struct SupervisedTool {
    inner: Arc<ToolInner>,
    control: tokio::sync::Mutex<()>,
}

impl SupervisedTool {
    pub fn new(def: ToolDefinition, resources: Arc<ResourceManager>, stop_grace: Duration) -> Self {
        Self {
            inner: Arc::new(ToolInner {
                def,
                resources,
                stop_grace,
                core: Mutex::new(ToolCore::default()),
            }),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.inner.def
    }
}

impl ToolInner {
    fn lock(&self) -> MutexGuard<'_, ToolCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        if let Some(device) = self.def.device {
            if let Err(err) = self.resources.release(device, &self.def.name) {
                debug!(
                    target: "rfdeck::tool",
                    tool = %self.def.name,
                    error = %err,
                    "lease not released"
                );
            }
        }
    }

    fn holds_lease(&self) -> bool {
        match self.def.device {
            Some(device) => self.resources.owner(device).as_deref() == Some(self.def.name.as_str()),
            None => true,
        }
    }

    fn fail(&self, core: &mut ToolCore, message: String) {
        warn!(target: "rfdeck::tool", tool = %self.def.name, reason = %message, "tool failed");
        if let Some(process) = core.process.take() {
            process.kill();
        }
        self.release();
        core.state = ToolState::Error;
        core.last_error = Some(message);
    }

    fn on_exit(&self, session: u64, process: &ProcessSupervisor, outcome: rfdeck_ipc::ExitOutcome) {
        let mut core = self.lock();
        if core.session != session || core.state != ToolState::Running {
            return;
        }
        core.process = None;
        self.release();
        if outcome.is_clean() {
            info!(target: "rfdeck::tool", tool = %self.def.name, "tool finished");
            core.state = ToolState::Idle;
        } else {
            let last = process
                .tail()
                .last()
                .map(|line| format!("; last output: {}", line.text))
                .unwrap_or_default();
            warn!(
                target: "rfdeck::tool",
                tool = %self.def.name,
                outcome = %outcome,
                "tool exited unexpectedly"
            );
            core.state = ToolState::Error;
            core.last_error = Some(format!("{} {}{}", self.def.program, outcome, last));
        }
    }

    fn status(&self) -> ToolStatus {
        let mut core = self.lock();
        if core.state == ToolState::Running && !self.holds_lease() {
            self.fail(&mut core, "device lease lost".to_string());
        }
        let process = core.process.as_ref();
        ToolStatus {
            name: self.def.name.clone(),
            device: self.def.device,
            state: core.state,
            pid: process.and_then(|p| p.pid()),
            started_at: core.started_at,
            last_error: core.last_error.clone(),
            tail: process.map(|p| p.tail()).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ToolManager for SupervisedTool {
    fn name(&self) -> &str {
        &self.inner.def.name
    }

    fn device(&self) -> Option<Device> {
        self.inner.def.device
    }

    async fn start(&self, params: Value) -> Result<ToolStatus> {
        let params: StartParams = if params.is_null() {
            StartParams::default()
        } else {
            serde_json::from_value(params)
                .map_err(|err| CoreError::InvalidConfig(format!("tool parameters: {err}")))?
        };

        let inner = &self.inner;
        let def = &inner.def;
        let (session, process) = {
            let mut core = inner.lock();
            if matches!(
                core.state,
                ToolState::Starting | ToolState::Running | ToolState::Stopping
            ) {
                return Err(CoreError::AlreadyRunning);
            }
            if let Some(device) = def.device {
                inner.resources.acquire(device, &def.name)?;
            }

            let mut args = def.args.clone();
            args.extend(params.args);
            let process = match ProcessSupervisor::spawn(ProcessSpec::new(def.program.clone(), args)) {
                Ok(process) => Arc::new(process),
                Err(err) => {
                    let err = CoreError::from(err);
                    inner.release();
                    core.state = ToolState::Error;
                    core.last_error = Some(err.to_string());
                    return Err(err);
                }
            };
            if let (Some(device), Some(pid)) = (def.device, process.pid()) {
                let _ = inner.resources.attach_process(device, &def.name, pid);
            }
            // Output is only kept as a tail for status.
            drop(process.take_lines());

            core.session += 1;
            core.state = ToolState::Running;
            core.started_at = Some(Utc::now());
            core.last_error = None;
            core.process = Some(Arc::clone(&process));
            info!(target: "rfdeck::tool", tool = %def.name, pid = ?process.pid(), "tool started");
            (core.session, process)
        };

        let watcher = Arc::clone(inner);
        tokio::spawn(async move {
            let outcome = process.wait_exit().await;
            watcher.on_exit(session, &process, outcome);
        });

        Ok(inner.status())
    }

    async fn stop(&self) -> Result<()> {
        let _control = self.control.lock().await;
        let inner = &self.inner;
        let (session, process) = {
            let mut core = inner.lock();
            match core.state {
                ToolState::Idle => return Ok(()),
                ToolState::Error => {
                    if let Some(process) = core.process.take() {
                        process.kill();
                    }
                    inner.release();
                    core.state = ToolState::Idle;
                    return Ok(());
                }
                _ => {
                    core.state = ToolState::Stopping;
                    (core.session, core.process.clone())
                }
            }
        };

        if let Some(process) = &process {
            let outcome = process.stop(inner.stop_grace).await;
            info!(
                target: "rfdeck::tool",
                tool = %inner.def.name,
                outcome = %outcome,
                "tool stopped"
            );
        }

        let mut core = inner.lock();
        if core.session == session {
            core.process = None;
            inner.release();
            core.state = ToolState::Idle;
        }
        Ok(())
    }

    async fn status(&self) -> ToolStatus {
        self.inner.status()
    }
}

/// All tool managers by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolManager>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolManager>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(CoreError::InvalidConfig(format!(
                "tool '{name}' is registered twice"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolManager>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTool(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub async fn statuses(&self) -> Vec<ToolStatus> {
        let mut out = Vec::with_capacity(self.tools.len());
        for tool in self.tools.values() {
            out.push(tool.status().await);
        }
        out
    }

    /// Stops every tool, logging failures instead of returning early.
    pub async fn stop_all(&self) {
        for (name, tool) in &self.tools {
            if let Err(err) = tool.stop().await {
                warn!(
                    target: "rfdeck::tool",
                    tool = %name,
                    error = %err,
                    "stop during shutdown failed"
                );
            }
        }
    }
}

/// Reads tool definitions; a missing file means no extra tools.
pub fn load_definitions(path: &Path) -> Result<Vec<ToolDefinition>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&contents)
        .map_err(|err| CoreError::InvalidConfig(format!("{}: {}", path.display(), err)))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use tokio::time::sleep;

    use super::*;

    fn tool(name: &str, device: Device, script: &str, rm: &Arc<ResourceManager>) -> SupervisedTool {
        SupervisedTool::new(
            ToolDefinition {
                name: name.to_string(),
                device: Some(device),
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            Arc::clone(rm),
            Duration::from_secs(2),
        )
    }

    async fn wait_for(tool: &SupervisedTool, state: ToolState) -> ToolStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = tool.status().await;
            if status.state == state {
                return status;
            }
            assert!(Instant::now() < deadline, "stuck in {:?}", status.state);
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_holds_lease_until_stop() {
        let rm = Arc::new(ResourceManager::default());
        let scanner = tool("btle-scan", Device::Bluetooth, "exec sleep 30", &rm);
        let rival = tool("bt-sniff", Device::Bluetooth, "exec sleep 30", &rm);

        let status = scanner.start(Value::Null).await.unwrap();
        assert_eq!(status.state, ToolState::Running);
        assert!(status.pid.is_some());
        assert_eq!(rm.owner(Device::Bluetooth).as_deref(), Some("btle-scan"));

        assert!(matches!(
            scanner.start(Value::Null).await,
            Err(CoreError::AlreadyRunning)
        ));
        assert!(matches!(
            rival.start(Value::Null).await,
            Err(CoreError::DeviceBusy { .. })
        ));

        scanner.stop().await.unwrap();
        assert_eq!(scanner.status().await.state, ToolState::Idle);
        assert!(rm.is_available(Device::Bluetooth));
    }

    #[tokio::test]
    async fn failed_exit_releases_device() {
        let rm = Arc::new(ResourceManager::default());
        let t = tool("kismet", Device::Alfa, "echo 'no interface' >&2; exit 4", &rm);
        t.start(Value::Null).await.unwrap();

        let status = wait_for(&t, ToolState::Error).await;
        let message = status.last_error.unwrap();
        assert!(message.contains("exited with code 4"), "{message}");
        assert!(rm.is_available(Device::Alfa));
    }

    #[tokio::test]
    async fn extra_args_are_appended() {
        let rm = Arc::new(ResourceManager::default());
        let t = tool("echo-args", Device::Alfa, "echo \"$0 $1\"; exec sleep 30", &rm);
        t.start(json!({ "args": ["first", "second"] })).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = t.status().await;
            if status.tail.iter().any(|l| l.text == "first second") {
                break;
            }
            assert!(Instant::now() < deadline, "tail: {:?}", status.tail);
            sleep(Duration::from_millis(20)).await;
        }
        t.stop().await.unwrap();
    }

    #[tokio::test]
    async fn registry_dispatch() {
        let rm = Arc::new(ResourceManager::default());
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(tool("a", Device::Alfa, "exec sleep 30", &rm)))
            .unwrap();
        assert!(registry
            .register(Arc::new(tool("a", Device::Alfa, "exec sleep 30", &rm)))
            .is_err());
        assert!(matches!(
            registry.get("missing"),
            Err(CoreError::UnknownTool(_))
        ));

        registry.get("a").unwrap().start(Value::Null).await.unwrap();
        registry.stop_all().await;
        let statuses = registry.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ToolState::Idle);
        assert!(rm.is_available(Device::Alfa));
    }

    #[test]
    fn definitions_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.json");
        assert!(load_definitions(&path).unwrap().is_empty());

        std::fs::write(
            &path,
            r#"[{"name":"kismet","device":"alfa","program":"kismet","args":["-c","wlan1"]}]"#,
        )
        .unwrap();
        let defs = load_definitions(&path).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].device, Some(Device::Alfa));
        assert_eq!(defs[0].args, vec!["-c", "wlan1"]);

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            load_definitions(&path),
            Err(CoreError::InvalidConfig(_))
        ));
    }
}
