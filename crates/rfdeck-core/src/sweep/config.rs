use std::time::Duration;

use rfdeck_ipc::SweepConfig;

use crate::error::{CoreError, Result};

pub const MIN_FREQ_HZ: u64 = 1_000_000;
pub const MAX_FREQ_HZ: u64 = 7_250_000_000;
pub const MIN_SPAN_HZ: u64 = 1_000_000;
pub const MAX_VGA_GAIN: u32 = 62;
pub const MAX_LNA_GAIN: u32 = 40;
pub const MIN_BIN_WIDTH_HZ: u32 = 2_445;
pub const MAX_BIN_WIDTH_HZ: u32 = 5_000_000;
const HIGH_BAND_HZ: u64 = 5_000_000_000;

pub const DEFAULT_OWNER: &str = "hackrf-sweep";
pub const DEFAULT_PROGRAM: &str = "hackrf_sweep";
pub const DEFAULT_PROBE_PROGRAM: &str = "hackrf_info";
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(3000);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_millis(120_000);
pub const DEFAULT_MAX_PARSE_FAILURES: u32 = 25;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Runtime knobs for a sweep manager, fixed at construction.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub program: String,
    /// Prepended to the generated arguments.
    pub base_args: Vec<String>,
    pub owner: String,
    pub stop_grace: Duration,
    pub startup_timeout: Duration,
    /// Longest gap between samples once running. Zero disables the watchdog.
    pub data_timeout: Duration,
    pub max_consecutive_parse_failures: u32,
    pub subscriber_capacity: usize,
    pub probe_program: String,
    pub probe_timeout: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            base_args: Vec::new(),
            owner: DEFAULT_OWNER.to_string(),
            stop_grace: DEFAULT_STOP_GRACE,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            data_timeout: DEFAULT_DATA_TIMEOUT,
            max_consecutive_parse_failures: DEFAULT_MAX_PARSE_FAILURES,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            probe_program: DEFAULT_PROBE_PROGRAM.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// A validated sweep request, ready to become an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub freq_min_mhz: u64,
    pub freq_max_mhz: u64,
    pub vga_gain: u32,
    pub lna_gain: u32,
    pub bin_width_hz: u32,
}

impl SweepPlan {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-f".to_string(),
            format!("{}:{}", self.freq_min_mhz, self.freq_max_mhz),
            "-g".to_string(),
            self.vga_gain.to_string(),
            "-l".to_string(),
            self.lna_gain.to_string(),
            "-w".to_string(),
            self.bin_width_hz.to_string(),
        ]
    }
}

/// Checks bounds and fills band-dependent gain defaults.
pub fn validate(cfg: &SweepConfig) -> Result<SweepPlan> {
    if cfg.span_hz < MIN_SPAN_HZ {
        return Err(invalid(format!(
            "span {} Hz is below the {} Hz minimum",
            cfg.span_hz, MIN_SPAN_HZ
        )));
    }
    let half_span = cfg.span_hz / 2;
    let low = cfg
        .center_freq_hz
        .checked_sub(half_span)
        .filter(|low| *low >= MIN_FREQ_HZ)
        .ok_or_else(|| {
            invalid(format!(
                "sweep starts below {} MHz (center {} Hz, span {} Hz)",
                MIN_FREQ_HZ / 1_000_000,
                cfg.center_freq_hz,
                cfg.span_hz
            ))
        })?;
    let high = cfg
        .center_freq_hz
        .checked_add(half_span)
        .filter(|high| *high <= MAX_FREQ_HZ)
        .ok_or_else(|| {
            invalid(format!(
                "sweep ends above {} MHz (center {} Hz, span {} Hz)",
                MAX_FREQ_HZ / 1_000_000,
                cfg.center_freq_hz,
                cfg.span_hz
            ))
        })?;

    let (default_vga, default_lna) = if cfg.center_freq_hz > HIGH_BAND_HZ {
        (30, 40)
    } else {
        (20, 32)
    };
    let vga_gain = cfg.gain.unwrap_or(default_vga);
    if vga_gain > MAX_VGA_GAIN {
        return Err(invalid(format!(
            "VGA gain {} dB is outside 0..={}",
            vga_gain, MAX_VGA_GAIN
        )));
    }
    let lna_gain = cfg.lna_gain.unwrap_or(default_lna);
    if lna_gain > MAX_LNA_GAIN {
        return Err(invalid(format!(
            "LNA gain {} dB is outside 0..={}",
            lna_gain, MAX_LNA_GAIN
        )));
    }
    if !(MIN_BIN_WIDTH_HZ..=MAX_BIN_WIDTH_HZ).contains(&cfg.bin_width_hz) {
        return Err(invalid(format!(
            "bin width {} Hz is outside {}..={}",
            cfg.bin_width_hz, MIN_BIN_WIDTH_HZ, MAX_BIN_WIDTH_HZ
        )));
    }

    Ok(SweepPlan {
        freq_min_mhz: low / 1_000_000,
        freq_max_mhz: high.div_ceil(1_000_000),
        vga_gain,
        lna_gain,
        bin_width_hz: cfg.bin_width_hz,
    })
}

fn invalid(message: String) -> CoreError {
    CoreError::InvalidConfig(message)
}
