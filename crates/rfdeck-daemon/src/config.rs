use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rfdeck_core::sweep::config::{
    DEFAULT_DATA_TIMEOUT, DEFAULT_MAX_PARSE_FAILURES, DEFAULT_PROGRAM, DEFAULT_STARTUP_TIMEOUT,
    DEFAULT_STOP_GRACE,
};
use rfdeck_core::SweepSettings;
use rfdeck_ipc::MAX_FRAME;

pub const DEFAULT_SOCKET_PATH: &str = "/run/rfdeck/rfdeckd.sock";
pub const DEFAULT_ROOT_PATH: &str = "/var/lib/rfdeck";
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 20;
pub const TOOLS_FILENAME: &str = "tools.json";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub root_path: PathBuf,
    pub max_frame: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub max_requests_per_second: u32,
    pub sweep: SweepSettings,
    pub tools_file: PathBuf,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let socket_path = env::var("RFDECKD_SOCKET")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        let root_path = env::var("RFDECK_ROOT")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_PATH));
        let max_frame = env_parse("RFDECKD_MAX_FRAME", MAX_FRAME);
        let read_timeout_ms = env_parse("RFDECKD_READ_TIMEOUT_MS", DEFAULT_READ_TIMEOUT_MS);
        let write_timeout_ms = env_parse("RFDECKD_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS);
        let max_connections = env_parse("RFDECKD_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        let max_requests_per_second = env_parse(
            "RFDECKD_MAX_REQUESTS_PER_SECOND",
            DEFAULT_MAX_REQUESTS_PER_SECOND,
        );

        let sweep = SweepSettings {
            program: env::var("RFDECKD_SWEEP_BIN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROGRAM.to_string()),
            stop_grace: Duration::from_millis(env_parse(
                "RFDECKD_SWEEP_GRACE_MS",
                DEFAULT_STOP_GRACE.as_millis() as u64,
            )),
            startup_timeout: Duration::from_millis(env_parse(
                "RFDECKD_SWEEP_STARTUP_TIMEOUT_MS",
                DEFAULT_STARTUP_TIMEOUT.as_millis() as u64,
            )),
            data_timeout: Duration::from_millis(env_parse(
                "RFDECKD_SWEEP_DATA_TIMEOUT_MS",
                DEFAULT_DATA_TIMEOUT.as_millis() as u64,
            )),
            max_consecutive_parse_failures: env_parse(
                "RFDECKD_SWEEP_MAX_PARSE_FAILURES",
                DEFAULT_MAX_PARSE_FAILURES,
            )
            .max(1),
            ..SweepSettings::default()
        };

        let tools_file = env::var("RFDECKD_TOOLS_FILE")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| root_path.join("config").join(TOOLS_FILENAME));

        Self {
            socket_path,
            root_path,
            max_frame,
            read_timeout: Duration::from_millis(read_timeout_ms),
            write_timeout: Duration::from_millis(write_timeout_ms),
            max_connections,
            max_requests_per_second,
            sweep,
            tools_file,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 13] = [
        "RFDECKD_SOCKET",
        "RFDECK_ROOT",
        "RFDECKD_MAX_FRAME",
        "RFDECKD_READ_TIMEOUT_MS",
        "RFDECKD_WRITE_TIMEOUT_MS",
        "RFDECKD_MAX_CONNECTIONS",
        "RFDECKD_MAX_REQUESTS_PER_SECOND",
        "RFDECKD_SWEEP_BIN",
        "RFDECKD_SWEEP_GRACE_MS",
        "RFDECKD_SWEEP_STARTUP_TIMEOUT_MS",
        "RFDECKD_SWEEP_DATA_TIMEOUT_MS",
        "RFDECKD_SWEEP_MAX_PARSE_FAILURES",
        "RFDECKD_TOOLS_FILE",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            if !self.vars.iter().any(|(k, _)| k == key) {
                self.vars.push((key.to_string(), std::env::var(key).ok()));
            }
            std::env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            if !self.vars.iter().any(|(k, _)| k == key) {
                self.vars.push((key.to_string(), std::env::var(key).ok()));
            }
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        for key in KEYS {
            guard.remove(key);
        }

        let cfg = DaemonConfig::from_env();
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(cfg.max_frame, MAX_FRAME);
        assert_eq!(cfg.read_timeout, Duration::from_millis(DEFAULT_READ_TIMEOUT_MS));
        assert_eq!(cfg.max_requests_per_second, DEFAULT_MAX_REQUESTS_PER_SECOND);
        assert_eq!(cfg.sweep.program, "hackrf_sweep");
        assert_eq!(cfg.sweep.stop_grace, Duration::from_secs(3));
        assert_eq!(cfg.sweep.max_consecutive_parse_failures, 25);
        assert_eq!(cfg.sweep.data_timeout, Duration::from_secs(120));
        assert_eq!(
            cfg.tools_file,
            PathBuf::from(DEFAULT_ROOT_PATH).join("config").join(TOOLS_FILENAME)
        );
    }

    #[test]
    fn overrides_and_bad_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        for key in KEYS {
            guard.remove(key);
        }
        guard.set("RFDECK_ROOT", "/tmp/rfdeck-root");
        guard.set("RFDECKD_SWEEP_BIN", "/opt/hackrf/bin/hackrf_sweep");
        guard.set("RFDECKD_SWEEP_GRACE_MS", "750");
        guard.set("RFDECKD_SWEEP_MAX_PARSE_FAILURES", "0");
        guard.set("RFDECKD_SWEEP_DATA_TIMEOUT_MS", "0");
        guard.set("RFDECKD_MAX_CONNECTIONS", "not-a-number");

        let cfg = DaemonConfig::from_env();
        assert_eq!(cfg.sweep.program, "/opt/hackrf/bin/hackrf_sweep");
        assert_eq!(cfg.sweep.stop_grace, Duration::from_millis(750));
        assert_eq!(cfg.sweep.max_consecutive_parse_failures, 1);
        assert_eq!(cfg.sweep.data_timeout, Duration::ZERO);
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(
            cfg.tools_file,
            PathBuf::from("/tmp/rfdeck-root/config/tools.json")
        );
    }
}
