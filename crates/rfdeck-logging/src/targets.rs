//! Tracing targets that get their own log file.

/// Device leases: acquire, release, force release.
pub const T_RESOURCE: &str = "rfdeck::resource";
/// Spawned child processes: spawn, signals, exit.
pub const T_PROCESS: &str = "rfdeck::process";
/// Sweep state machine and frame parsing.
pub const T_SWEEP: &str = "rfdeck::sweep";
/// Configured external tools.
pub const T_TOOL: &str = "rfdeck::tool";

pub const SUBSYSTEMS: [(&str, &str); 4] = [
    (T_RESOURCE, "resource.log"),
    (T_PROCESS, "process.log"),
    (T_SWEEP, "sweep.log"),
    (T_TOOL, "tool.log"),
];
