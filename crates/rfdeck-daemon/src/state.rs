use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use rfdeck_core::{
    load_definitions, ResourceManager, SupervisedTool, SweepManager, ToolManager, ToolRegistry,
};

use crate::config::DaemonConfig;

pub struct DaemonState {
    pub config: DaemonConfig,
    pub start_time: Instant,
    pub resources: Arc<ResourceManager>,
    pub sweep: SweepManager,
    pub tools: ToolRegistry,
    pub version: String,
}

impl DaemonState {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let start_time = Instant::now();
        let resources = Arc::new(ResourceManager::default());
        let sweep = SweepManager::new(config.sweep.clone(), Arc::clone(&resources));

        let mut tools = ToolRegistry::new();
        tools
            .register(Arc::new(sweep.clone()) as Arc<dyn ToolManager>)
            .context("registering sweep manager")?;
        let definitions = load_definitions(&config.tools_file)
            .with_context(|| format!("loading {}", config.tools_file.display()))?;
        for def in definitions {
            let name = def.name.clone();
            let tool = SupervisedTool::new(def, Arc::clone(&resources), config.sweep.stop_grace);
            tools
                .register(Arc::new(tool))
                .with_context(|| format!("registering tool {name}"))?;
            info!(tool = %name, "tool registered");
        }

        let version = env!("CARGO_PKG_VERSION").to_string();
        Ok(Self {
            config,
            start_time,
            resources,
            sweep,
            tools,
            version,
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Kills the sweep, stops every tool and drops any lease still held.
    pub async fn shutdown(&self) {
        self.sweep.shutdown().await;
        self.tools.stop_all().await;
        for device in self.resources.registry().iter() {
            if let Ok(Some(lease)) = self.resources.force_release(device) {
                info!(device = %device, owner = %lease.owner, "lease dropped at shutdown");
            }
        }
    }
}
