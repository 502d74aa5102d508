use std::time::Duration;

use chrono::Utc;
use rfdeck_ipc::HackrfHealth;
use tracing::debug;

use crate::supervisor::{run_to_completion, Completed, ProcessSpec, SupervisorError};

/// Runs the device info tool and classifies its output.
pub async fn probe_hackrf(program: &str, args: &[String], limit: Duration) -> HackrfHealth {
    let spec = ProcessSpec::new(program, args.to_vec());
    let result = run_to_completion(spec, limit).await;
    let health = classify(result);
    debug!(
        target: "rfdeck::sweep",
        connected = health.connected,
        error = ?health.error,
        "hackrf probe finished"
    );
    health
}

fn classify(result: Result<Completed, SupervisorError>) -> HackrfHealth {
    let checked_at = Utc::now();
    let unhealthy = |error: String| HackrfHealth {
        connected: false,
        device_info: None,
        error: Some(error),
        checked_at,
    };

    let completed = match result {
        Ok(completed) => completed,
        Err(SupervisorError::Timeout(_)) => return unhealthy("device check timeout".to_string()),
        Err(err) => return unhealthy(format!("device check failed: {err}")),
    };

    if completed.stderr().any(|l| l.contains("Resource busy")) {
        return unhealthy("device busy".to_string());
    }
    if completed.lines.iter().any(|l| l.text.contains("No HackRF boards found")) {
        return unhealthy("no HackRF found".to_string());
    }
    if !completed.outcome.is_clean() {
        return unhealthy(format!("device check failed: {}", completed.outcome));
    }
    if completed.stdout().any(|l| l.contains("Serial number")) {
        let info = completed
            .stdout()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        return HackrfHealth {
            connected: true,
            device_info: Some(info),
            error: None,
            checked_at,
        };
    }
    unhealthy("unrecognised device check output".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn detects_connected_board() {
        let health = probe_hackrf(
            "sh",
            &sh("echo 'Found HackRF'; echo 'Serial number: 0000000000000000457863c82b2d6b5f'"),
            Duration::from_secs(5),
        )
        .await;
        assert!(health.connected);
        assert!(health.device_info.unwrap().contains("Serial number"));
    }

    #[tokio::test]
    async fn reports_missing_and_busy_boards() {
        let missing = probe_hackrf(
            "sh",
            &sh("echo 'No HackRF boards found.'; exit 1"),
            Duration::from_secs(5),
        )
        .await;
        assert!(!missing.connected);
        assert_eq!(missing.error.as_deref(), Some("no HackRF found"));

        let busy = probe_hackrf(
            "sh",
            &sh("echo 'hackrf_open() failed: Resource busy (-1000)' >&2; exit 1"),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(busy.error.as_deref(), Some("device busy"));
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        let health = probe_hackrf("sh", &sh("exec sleep 30"), Duration::from_millis(200)).await;
        assert!(!health.connected);
        assert_eq!(health.error.as_deref(), Some("device check timeout"));
    }

    #[tokio::test]
    async fn missing_tool_is_reported() {
        let health = probe_hackrf(
            "/nonexistent/hackrf_info",
            &[],
            Duration::from_secs(1),
        )
        .await;
        assert!(!health.connected);
        assert!(health.error.unwrap().starts_with("device check failed"));
    }
}
