//! Scan command implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use cgm_core::{BtleplugRadio, RadioEvent, RadioStack, TransmitterKind};

use crate::cli::OutputFormat;
use crate::format::{DiscoveredTransmitter, format_scan_csv, format_scan_json, format_scan_text};
use crate::util::write_output;

pub async fn cmd_scan(
    timeout: u64,
    all: bool,
    format: OutputFormat,
    output: Option<&PathBuf>,
    quiet: bool,
) -> Result<()> {
    if !quiet && format == OutputFormat::Text {
        eprintln!("Scanning for {timeout}s...");
    }

    let radio = BtleplugRadio::new()
        .await
        .context("No usable Bluetooth adapter")?;
    let devices = collect_transmitters(&radio, Duration::from_secs(timeout), all)
        .await
        .context("Failed to scan for transmitters")?;

    let content = match format {
        OutputFormat::Text => format_scan_text(&devices),
        OutputFormat::Json => format_scan_json(&devices)?,
        OutputFormat::Csv => format_scan_csv(&devices),
    };
    write_output(output, &content)
}

/// Listen for advertisements for `duration`, one entry per peripheral.
///
/// Unless `all` is set, only names a transmitter family claims are kept.
/// Results are sorted by signal strength, strongest first.
pub async fn collect_transmitters<R: RadioStack>(
    radio: &R,
    duration: Duration,
    all: bool,
) -> cgm_core::Result<Vec<DiscoveredTransmitter>> {
    let mut events = radio.events();
    radio.start_scan(&[]).await?;

    let mut seen: HashMap<String, DiscoveredTransmitter> = HashMap::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Ok(RadioEvent::Discovered(adv)) => {
                    let kind = adv.name.as_deref().and_then(TransmitterKind::from_name);
                    if kind.is_none() && !all {
                        continue;
                    }
                    debug!(id = %adv.id, name = ?adv.name, rssi = ?adv.rssi, "advertisement");
                    let entry = seen.entry(adv.id.clone()).or_insert(DiscoveredTransmitter {
                        identifier: adv.id,
                        name: None,
                        kind,
                        rssi: None,
                    });
                    // later advertisements carry the freshest name and signal
                    if adv.name.is_some() {
                        entry.name = adv.name;
                        entry.kind = kind;
                    }
                    if adv.rssi.is_some() {
                        entry.rssi = adv.rssi;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "scan fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    radio.stop_scan().await?;

    let mut devices: Vec<_> = seen.into_values().collect();
    devices.sort_by(|a, b| {
        b.rssi
            .unwrap_or(i16::MIN)
            .cmp(&a.rssi.unwrap_or(i16::MIN))
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgm_core::{AdapterState, MockPeripheral, MockRadio};

    fn radio() -> MockRadio {
        MockRadio::builder()
            .peripheral(MockPeripheral::blucon("AA:01", "BLU12345"))
            .peripheral(MockPeripheral::miaomiao("AA:02", "miaomiao2"))
            .peripheral(MockPeripheral::new("AA:03", "Kitchen scale"))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_transmitters_by_default() {
        let radio = radio();
        let found = collect_transmitters(&radio, Duration::from_secs(5), false)
            .await
            .unwrap();
        let mut ids: Vec<_> = found.iter().map(|d| d.identifier.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["AA:01", "AA:02"]);
        assert!(found.iter().all(|d| d.kind.is_some()));
        assert!(!radio.is_scanning().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_includes_unknown_peripherals() {
        let radio = radio();
        let found = collect_transmitters(&radio, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        let scale = found.iter().find(|d| d.identifier == "AA:03").unwrap();
        assert_eq!(scale.kind, None);
        assert_eq!(scale.name.as_deref(), Some("Kitchen scale"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_powered_off_adapter_fails() {
        let radio = MockRadio::builder()
            .adapter_state(AdapterState::PoweredOff)
            .build();
        assert!(
            collect_transmitters(&radio, Duration::from_secs(1), false)
                .await
                .is_err()
        );
    }
}
