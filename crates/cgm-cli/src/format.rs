//! Output formatting utilities for text, JSON, and CSV output.

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use cgm_core::{GlucoseSample, TransmitterKind};

/// A peripheral seen during `cgm scan`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredTransmitter {
    pub identifier: String,
    pub name: Option<String>,
    pub kind: Option<TransmitterKind>,
    pub rssi: Option<i16>,
}

/// Escape a string for CSV output.
/// Wraps the value in quotes if it contains commas, quotes, or newlines.
#[must_use]
pub fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

/// `2026-10-16 08:05` in UTC.
fn short_time(ts: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute()
    )
}

// ============================================================================
// Sample formatting
// ============================================================================

#[must_use]
pub fn format_sample_text(sample: &GlucoseSample, sensor_id: &str) -> String {
    let filtered = sample
        .filtered_value
        .map(|f| format!(" (filtered {f:.0})"))
        .unwrap_or_default();
    format!(
        "{}  {:>3.0} mg/dL{}  [{}]\n",
        short_time(sample.timestamp),
        sample.raw_value,
        filtered,
        sensor_id
    )
}

#[must_use]
pub fn sample_csv_header() -> &'static str {
    "timestamp,sensor_id,raw_mg_dl,filtered_mg_dl\n"
}

#[must_use]
pub fn format_sample_csv(sample: &GlucoseSample, sensor_id: &str) -> String {
    format!(
        "{},{},{:.1},{}\n",
        rfc3339(sample.timestamp),
        csv_escape(sensor_id),
        sample.raw_value,
        sample
            .filtered_value
            .map(|f| format!("{f:.1}"))
            .unwrap_or_default()
    )
}

/// One JSON object per line, so the stream can be piped.
pub fn format_sample_json(sample: &GlucoseSample, sensor_id: &str) -> Result<String> {
    #[derive(Serialize)]
    struct SampleJson<'a> {
        sensor_id: &'a str,
        #[serde(flatten)]
        sample: &'a GlucoseSample,
    }

    Ok(serde_json::to_string(&SampleJson { sensor_id, sample })? + "\n")
}

// ============================================================================
// Scan formatting
// ============================================================================

#[must_use]
pub fn format_scan_text(devices: &[DiscoveredTransmitter]) -> String {
    if devices.is_empty() {
        return "No CGM transmitters found.\n".to_string();
    }
    let mut output = format!("Found {} transmitter(s)\n\n", devices.len());
    output.push_str(&format!(
        "{:<20} {:<10} {:>6}  {}\n",
        "Name", "Type", "Signal", "Identifier"
    ));
    for device in devices {
        output.push_str(&format!(
            "{:<20} {:<10} {:>6}  {}\n",
            device.name.as_deref().unwrap_or("Unknown"),
            device.kind.map(|k| k.to_string()).unwrap_or_else(|| "-".into()),
            device
                .rssi
                .map(|r| format!("{r} dBm"))
                .unwrap_or_else(|| "-".into()),
            device.identifier
        ));
    }
    output
}

pub fn format_scan_json(devices: &[DiscoveredTransmitter]) -> Result<String> {
    #[derive(Serialize)]
    struct ScanResult<'a> {
        count: usize,
        devices: &'a [DiscoveredTransmitter],
    }

    let result = ScanResult {
        count: devices.len(),
        devices,
    };
    Ok(serde_json::to_string_pretty(&result)? + "\n")
}

#[must_use]
pub fn format_scan_csv(devices: &[DiscoveredTransmitter]) -> String {
    let mut output = "name,identifier,rssi,kind\n".to_string();
    for device in devices {
        output.push_str(&format!(
            "{},{},{},{}\n",
            csv_escape(device.name.as_deref().unwrap_or("")),
            csv_escape(&device.identifier),
            device.rssi.map(|r| r.to_string()).unwrap_or_default(),
            device.kind.map(|k| k.to_string()).unwrap_or_default()
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GlucoseSample {
        // 2026-10-16 08:05:00 UTC
        GlucoseSample::new(
            OffsetDateTime::from_unix_timestamp(1_792_137_900).unwrap(),
            123.4,
        )
    }

    fn devices() -> Vec<DiscoveredTransmitter> {
        vec![
            DiscoveredTransmitter {
                identifier: "AA:BB:CC:DD:EE:FF".into(),
                name: Some("BLU12345".into()),
                kind: Some(TransmitterKind::Blucon),
                rssi: Some(-61),
            },
            DiscoveredTransmitter {
                identifier: "11:22:33:44:55:66".into(),
                name: Some("Kitchen, scale".into()),
                kind: None,
                rssi: None,
            },
        ]
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_sample_text() {
        let line = format_sample_text(&sample(), "0M0008B8CSR");
        assert_eq!(line, "2026-10-16 08:05  123 mg/dL  [0M0008B8CSR]\n");
    }

    #[test]
    fn test_sample_csv_matches_header() {
        let line = format_sample_csv(&sample(), "DXCM99");
        assert_eq!(line, "2026-10-16T08:05:00Z,DXCM99,123.4,\n");
        assert_eq!(
            line.trim_end().split(',').count(),
            sample_csv_header().trim_end().split(',').count()
        );
    }

    #[test]
    fn test_sample_json_is_one_line() {
        let line = format_sample_json(&sample(), "DXCM99").unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["sensor_id"], "DXCM99");
        assert_eq!(value["raw_value"], 123.4);
        assert_eq!(value["timestamp"], "2026-10-16T08:05:00Z");
        assert!(value.get("filtered_value").is_none());
    }

    #[test]
    fn test_scan_text() {
        assert_eq!(format_scan_text(&[]), "No CGM transmitters found.\n");
        let text = format_scan_text(&devices());
        assert!(text.starts_with("Found 2 transmitter(s)"));
        assert!(text.contains("BLU12345"));
        assert!(text.contains("-61 dBm"));
        assert!(text.contains("Blucon"));
    }

    #[test]
    fn test_scan_json() {
        let json = format_scan_json(&devices()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["count"], 2);
        assert_eq!(value["devices"][0]["kind"], "blucon");
        assert!(value["devices"][1]["kind"].is_null());
    }

    #[test]
    fn test_scan_csv() {
        let csv = format_scan_csv(&devices());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "name,identifier,rssi,kind");
        assert_eq!(lines[1], "BLU12345,AA:BB:CC:DD:EE:FF,-61,Blucon");
        assert_eq!(lines[2], "\"Kitchen, scale\",11:22:33:44:55:66,,");
    }
}
