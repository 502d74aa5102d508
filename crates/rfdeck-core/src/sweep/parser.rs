//! Text frames from `hackrf_sweep`:
//!
//! `date, time, hz_low, hz_high, hz_bin_width, num_samples, dB, dB, ...`
//!
//! A short form without the leading date and time is also accepted.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use rfdeck_ipc::SpectrumSample;

pub const MAX_LINE_LEN: usize = 10_000;
pub const MIN_POWER_DBM: f32 = -150.0;
pub const MAX_POWER_DBM: f32 = 50.0;
const MIN_FIELDS: usize = 7;

/// Tool chatter that is not a frame and not a failure either.
const NON_DATA_PREFIXES: &[&str] = &[
    "Found HackRF",
    "call_result is",
    "Reading samples",
    "Streaming samples",
    "Stop with Ctrl-C",
    "hackrf_sweep version",
    "bandwidth_hz",
    "sample_rate_hz",
    "baseband_filter_bw_hz",
    "RSSI:",
    "No HackRF boards found",
    "hackrf_open() failed",
    "Resource busy",
    "Permission denied",
    "libusb_open() failed",
    "USB error",
    "ERROR:",
    "WARNING:",
    "INFO:",
    "DEBUG:",
    "Sweeping from",
    "usb_api_version",
    "Exiting",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Sample(SpectrumSample),
    Ignored,
    Malformed(String),
}

pub fn is_non_data_line(line: &str) -> bool {
    NON_DATA_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Ignored;
    }
    if line.len() > MAX_LINE_LEN {
        return ParsedLine::Malformed(format!("line too long ({} bytes)", line.len()));
    }
    if is_non_data_line(line) {
        return ParsedLine::Ignored;
    }
    match parse_frame(line) {
        Ok(sample) => ParsedLine::Sample(sample),
        Err(reason) => ParsedLine::Malformed(reason),
    }
}

fn parse_frame(line: &str) -> Result<SpectrumSample, String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < MIN_FIELDS {
        return Err(format!("expected at least {} fields, got {}", MIN_FIELDS, parts.len()));
    }

    let has_timestamp = parts[0].contains('-') && parts[0].len() >= 8;
    let (timestamp, fields) = if has_timestamp {
        (parse_timestamp(parts[0], parts[1]), &parts[2..])
    } else {
        (Utc::now(), &parts[..])
    };

    let start_freq_hz = parse_field::<u64>(fields[0], "hz_low")?;
    let stop_freq_hz = parse_field::<u64>(fields[1], "hz_high")?;
    let bin_width_hz = parse_field::<f64>(fields[2], "bin_width")?;
    parse_field::<u64>(fields[3], "num_samples")?;

    if !bin_width_hz.is_finite() || bin_width_hz <= 0.0 {
        return Err(format!("invalid bin width {}", bin_width_hz));
    }
    if start_freq_hz >= stop_freq_hz {
        return Err(format!(
            "inverted frequency range {}..{}",
            start_freq_hz, stop_freq_hz
        ));
    }

    let mut power_bins = Vec::with_capacity(fields.len().saturating_sub(4));
    for raw in fields[4..].iter().filter(|raw| !raw.is_empty()) {
        let power: f32 = raw
            .parse()
            .map_err(|_| format!("power value '{}' is not a number", raw))?;
        if !power.is_finite() || !(MIN_POWER_DBM..=MAX_POWER_DBM).contains(&power) {
            return Err(format!("power value {} outside plausible range", power));
        }
        power_bins.push(power);
    }
    if power_bins.is_empty() {
        return Err("frame has no power bins".to_string());
    }

    Ok(SpectrumSample {
        timestamp,
        start_freq_hz,
        stop_freq_hz,
        bin_width_hz,
        power_bins,
    })
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, String> {
    raw.parse::<T>()
        .map_err(|_| format!("{} '{}' is not a number", name, raw))
}

/// `hackrf_sweep` prints local wall-clock time; unreadable stamps fall back to now.
fn parse_timestamp(date: &str, time: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = "2024-03-01, 12:30:45.123456, 2400000000, 2405000000, 1000000.00, 20, -70.5, -68.2, -71.0, -69.9, -72.3";

    #[test]
    fn parses_full_frame() {
        match parse_line(FRAME) {
            ParsedLine::Sample(sample) => {
                assert_eq!(sample.start_freq_hz, 2_400_000_000);
                assert_eq!(sample.stop_freq_hz, 2_405_000_000);
                assert_eq!(sample.bin_width_hz, 1_000_000.0);
                assert_eq!(sample.power_bins, vec![-70.5, -68.2, -71.0, -69.9, -72.3]);
                assert_eq!(sample.peak_dbm(), Some(-68.2));
                let expected = Local
                    .with_ymd_and_hms(2024, 3, 1, 12, 30, 45)
                    .earliest()
                    .unwrap()
                    .with_timezone(&Utc);
                assert_eq!(sample.timestamp.timestamp(), expected.timestamp());
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn parses_short_frame() {
        let line = "88000000, 93000000, 500000, 10, -40.0, -41.5, -39.0";
        match parse_line(line) {
            ParsedLine::Sample(sample) => {
                assert_eq!(sample.start_freq_hz, 88_000_000);
                assert_eq!(sample.power_bins.len(), 3);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn banners_and_blank_lines_are_ignored() {
        assert_eq!(parse_line(""), ParsedLine::Ignored);
        assert_eq!(parse_line("Found HackRF"), ParsedLine::Ignored);
        assert_eq!(parse_line("call_result is 0"), ParsedLine::Ignored);
        assert_eq!(
            parse_line("hackrf_open() failed: Resource busy (-1000)"),
            ParsedLine::Ignored
        );
    }

    #[test]
    fn malformed_frames_are_reported() {
        let cases = [
            "garbage",
            "1, 2, 3",
            "2024-03-01, 12:00:00, abc, 2405000000, 1000000, 20, -70.0",
            "2024-03-01, 12:00:00, 2405000000, 2400000000, 1000000, 20, -70.0",
            "2024-03-01, 12:00:00, 2400000000, 2405000000, 1000000, 20, -70.0, NaN",
            "2024-03-01, 12:00:00, 2400000000, 2405000000, 1000000, 20, 120.0",
            "2024-03-01, 12:00:00, 2400000000, 2405000000, 1000000, 20, , ",
            "2024-03-01, 12:00:00, 2400000000, 2405000000, 1000000, 20, -70.0, loud",
        ];
        for line in cases {
            assert!(
                matches!(parse_line(line), ParsedLine::Malformed(_)),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn overlong_line_is_rejected() {
        let line = format!("{}{}", FRAME, ", -70.0".repeat(2_000));
        assert!(line.len() > MAX_LINE_LEN);
        assert!(matches!(parse_line(&line), ParsedLine::Malformed(_)));
    }

    #[test]
    fn bad_timestamp_falls_back_to_now() {
        let line = "2024-99-99, noon, 2400000000, 2405000000, 1000000, 20, -70.0";
        let before = Utc::now();
        match parse_line(line) {
            ParsedLine::Sample(sample) => assert!(sample.timestamp >= before),
            other => panic!("expected sample, got {:?}", other),
        }
    }
}
