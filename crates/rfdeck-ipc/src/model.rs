use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive physical resources shared between tool managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Hackrf,
    Alfa,
    Bluetooth,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Hackrf, Device::Alfa, Device::Bluetooth];

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Hackrf => "hackrf",
            Device::Alfa => "alfa",
            Device::Bluetooth => "bluetooth",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDeviceName(pub String);

impl fmt::Display for UnknownDeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown device '{}'", self.0)
    }
}

impl std::error::Error for UnknownDeviceName {}

impl FromStr for Device {
    type Err = UnknownDeviceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hackrf" => Ok(Device::Hackrf),
            "alfa" => Ok(Device::Alfa),
            "bluetooth" => Ok(Device::Bluetooth),
            _ => Err(UnknownDeviceName(s.to_string())),
        }
    }
}

/// Exclusive ownership record for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub device: Device,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: Device,
    pub owner: Option<String>,
    pub available: bool,
    pub acquired_at: Option<DateTime<Utc>>,
    pub process_id: Option<u32>,
}

impl DeviceStatus {
    pub fn free(device: Device) -> Self {
        Self {
            device,
            owner: None,
            available: true,
            acquired_at: None,
            process_id: None,
        }
    }

    pub fn from_lease(device: Device, lease: Option<&Lease>) -> Self {
        match lease {
            Some(lease) => Self {
                device,
                owner: Some(lease.owner.clone()),
                available: false,
                acquired_at: Some(lease.acquired_at),
                process_id: lease.process_id,
            },
            None => Self::free(device),
        }
    }
}

/// Device name to ownership, the shape every status consumer merges in.
pub type HardwareStatus = BTreeMap<Device, DeviceStatus>;

pub const DEFAULT_SPAN_HZ: u64 = 20_000_000;
pub const DEFAULT_BIN_WIDTH_HZ: u32 = 20_000;

fn default_span_hz() -> u64 {
    DEFAULT_SPAN_HZ
}

fn default_bin_width_hz() -> u32 {
    DEFAULT_BIN_WIDTH_HZ
}

/// Sweep capture request as supplied by a caller; bounds are checked by the sweep manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(alias = "centerFreq")]
    pub center_freq_hz: u64,
    #[serde(default = "default_span_hz", alias = "span")]
    pub span_hz: u64,
    #[serde(default)]
    pub gain: Option<u32>,
    #[serde(default, alias = "lnaGain")]
    pub lna_gain: Option<u32>,
    #[serde(default = "default_bin_width_hz", alias = "binWidth")]
    pub bin_width_hz: u32,
}

impl SweepConfig {
    pub fn new(center_freq_hz: u64) -> Self {
        Self {
            center_freq_hz,
            span_hz: DEFAULT_SPAN_HZ,
            gain: None,
            lna_gain: None,
            bin_width_hz: DEFAULT_BIN_WIDTH_HZ,
        }
    }

    pub fn with_gain(mut self, gain: u32) -> Self {
        self.gain = Some(gain);
        self
    }
}

/// One parsed sweep frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSample {
    pub timestamp: DateTime<Utc>,
    pub start_freq_hz: u64,
    pub stop_freq_hz: u64,
    pub bin_width_hz: f64,
    pub power_bins: Vec<f32>,
}

impl SpectrumSample {
    pub fn center_freq_hz(&self) -> u64 {
        self.start_freq_hz.min(self.stop_freq_hz)
            + self.start_freq_hz.abs_diff(self.stop_freq_hz) / 2
    }

    pub fn peak_dbm(&self) -> Option<f32> {
        self.power_bins.iter().copied().reduce(f32::max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    EmergencyStopping,
    Error,
}

impl SweepState {
    pub fn is_active(self) -> bool {
        matches!(self, SweepState::Starting | SweepState::Running)
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SweepState::Idle => "idle",
            SweepState::Starting => "starting",
            SweepState::Running => "running",
            SweepState::Stopping => "stopping",
            SweepState::EmergencyStopping => "emergency_stopping",
            SweepState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStatus {
    pub state: SweepState,
    pub config: Option<SweepConfig>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub samples_received: u64,
    pub malformed_frames: u64,
    pub ignored_lines: u64,
    pub process_alive: bool,
    pub device: DeviceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited { code: i32 },
    Signaled { signal: i32 },
    KilledBySupervisor,
}

impl ExitOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Exited { code: 0 })
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited { code } => write!(f, "exited with code {}", code),
            ExitOutcome::Signaled { signal } => write!(f, "terminated by signal {}", signal),
            ExitOutcome::KilledBySupervisor => write!(f, "killed by supervisor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub program: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub alive: bool,
    pub kill_in_flight: bool,
    pub exit: Option<ExitOutcome>,
    pub tail: Vec<OutputLine>,
    pub dropped_lines: u64,
}

/// Deliberately narrow view of sweep internals for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProcessInfo {
    pub state: SweepState,
    pub session: u64,
    pub consecutive_parse_failures: u32,
    pub process: Option<ProcessInfo>,
    pub pending_kill: Option<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HackrfHealth {
    pub connected: bool,
    pub device_info: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub device: Option<Device>,
    pub state: ToolState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tail: Vec<OutputLine>,
}
