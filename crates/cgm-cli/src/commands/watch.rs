//! Watch command implementation.
//!
//! Runs the transmitter coordinator and prints every accepted reading as it
//! is stored. Connection state changes and sensor conditions go to the log.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cgm_core::{
    AlertSink, BtleplugRadio, CgmEvent, EventDispatcher, EventReceiver, GlucoseSample,
    GlucoseStore, MemoryStore, SensorError, SystemClock, TransmitterConfig,
    TransmitterCoordinator, session,
};

use crate::cli::OutputFormat;
use crate::config::{Config, update_last_device};
use crate::format::{format_sample_csv, format_sample_json, format_sample_text, sample_csv_header};
use crate::util::append_output;

/// Arguments for the watch command.
pub struct WatchArgs<'a> {
    pub transmitter: TransmitterConfig,
    pub format: OutputFormat,
    pub output: Option<&'a PathBuf>,
    pub once: bool,
    pub quiet: bool,
}

pub async fn cmd_watch(args: WatchArgs<'_>) -> Result<()> {
    let WatchArgs {
        transmitter,
        format,
        output,
        once,
        quiet,
    } = args;

    transmitter
        .validate()
        .context("Invalid transmitter settings (see `cgm config show`)")?;

    if !quiet {
        let target = if transmitter.transmitter_id.is_empty() {
            "first one in range".to_string()
        } else {
            transmitter.transmitter_id.clone()
        };
        eprintln!("Watching {} ({target}). Press Ctrl+C to stop.", transmitter.kind);
    }

    let radio = Arc::new(
        BtleplugRadio::new()
            .await
            .context("No usable Bluetooth adapter")?,
    );
    let dispatcher = EventDispatcher::default();
    tokio::spawn(log_events(dispatcher.subscribe(), Config::path()));

    let store = Arc::new(PrintingStore::new(format, output.cloned()));
    let mut coordinator = TransmitterCoordinator::new(
        radio,
        session::for_config(&transmitter),
        store,
        Arc::new(LogAlerts),
        Arc::new(SystemClock),
        transmitter,
        dispatcher,
    )?;

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    if !once {
        coordinator.run(cancel).await?;
        return Ok(());
    }

    let report = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        report = coordinator.poll_cycle() => report?,
    };
    if let Some(reason) = report.rejected {
        bail!("Transmitter refused this receiver: {reason}");
    }
    if !quiet {
        let outcome = if report.completed {
            "complete"
        } else if report.timed_out {
            "timed out"
        } else {
            "ended early"
        };
        eprintln!(
            "Cycle {outcome}: {} new reading(s), {} out of range",
            report.accepted.len(),
            report.out_of_range
        );
    }
    Ok(())
}

/// Print link events, and remember the transmitter once it connects.
async fn log_events(mut events: EventReceiver, config_path: PathBuf) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            CgmEvent::Connected { device } => {
                info!(id = %device.id, name = ?device.name, "connected");
                if let Err(e) = update_last_device(&config_path, &device.id) {
                    warn!(error = %e, "could not remember transmitter");
                }
            }
            CgmEvent::Disconnected {
                device,
                will_reconnect,
            } => info!(id = %device.id, will_reconnect, "disconnected"),
            CgmEvent::ReconnectStarted { device, attempt } => {
                info!(id = %device.id, attempt, "reconnecting");
            }
            CgmEvent::Rejected { device, reason } => {
                warn!(id = %device.id, %reason, "transmitter refused this receiver");
            }
            other => tracing::debug!(event = ?other, "event"),
        }
    }
}

/// [`GlucoseStore`] that prints each batch before keeping it.
struct PrintingStore {
    inner: MemoryStore,
    format: OutputFormat,
    output: Option<PathBuf>,
    header_written: AtomicBool,
}

impl PrintingStore {
    fn new(format: OutputFormat, output: Option<PathBuf>) -> Self {
        Self {
            inner: MemoryStore::new(),
            format,
            output,
            header_written: AtomicBool::new(false),
        }
    }

    fn render(&self, sensor_id: &str, samples: &[GlucoseSample]) -> Result<String> {
        let mut content = String::new();
        if self.format == OutputFormat::Csv && !self.header_written.swap(true, Ordering::SeqCst) {
            content.push_str(sample_csv_header());
        }
        for sample in samples {
            match self.format {
                OutputFormat::Text => content.push_str(&format_sample_text(sample, sensor_id)),
                OutputFormat::Json => content.push_str(&format_sample_json(sample, sensor_id)?),
                OutputFormat::Csv => content.push_str(&format_sample_csv(sample, sensor_id)),
            }
        }
        Ok(content)
    }
}

#[async_trait]
impl GlucoseStore for PrintingStore {
    async fn store_new_readings(
        &self,
        sensor_id: &str,
        samples: &[GlucoseSample],
    ) -> cgm_core::Result<()> {
        let content = self.render(sensor_id, samples).map_err(io::Error::other)?;
        append_output(self.output.as_ref(), &content)?;
        self.inner.store_new_readings(sensor_id, samples).await
    }

    async fn latest_stored_timestamp(
        &self,
        sensor_id: &str,
    ) -> cgm_core::Result<Option<OffsetDateTime>> {
        self.inner.latest_stored_timestamp(sensor_id).await
    }
}

/// [`AlertSink`] that writes to the log.
struct LogAlerts;

impl AlertSink for LogAlerts {
    fn new_sensor(&self, serial: Option<&str>) {
        info!(serial = serial.unwrap_or("unknown"), "new sensor");
    }

    fn battery_level(&self, percent: u8) {
        if percent < 20 {
            warn!(percent, "transmitter battery low");
        } else {
            info!(percent, "transmitter battery");
        }
    }

    fn sensor_age(&self, minutes: u32) {
        info!(days = %format!("{:.1}", f64::from(minutes) / 1440.0), "sensor age");
    }

    fn sensor_error(&self, error: &SensorError) {
        warn!(%error, "sensor");
    }

    fn transmitter_info(&self, firmware: &str, hardware: &str) {
        info!(firmware, hardware, "transmitter");
    }
}
