mod aggregation;
mod bluetooth;
mod config;
mod error;
mod models;
mod registry;
mod reprogram;
mod utils;
mod watchdog;

use log::{error, info, log, warn, Level};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use aggregation::Monitor;
use bluetooth::{power_on_adapters, CaptureBuffer, CaptureSession, CaptureSettings, HciRadio};
use config::MonitorConfig;
use registry::LogSink;
use reprogram::EspruinoFlasher;
use utils::format_datetime;

/// Without discovery only configured pucks are processed, so an empty cycle
/// means none of them was heard
fn empty_cycle_level(discovery: bool) -> Level {
    if discovery {
        Level::Info
    } else {
        Level::Warn
    }
}

/// Run aggregation cycles forever; a failed cycle never stops the schedule
async fn main_loop(monitor: Arc<Mutex<Monitor>>, discovery: bool) {
    info!("Starting Puck.js monitoring service");

    let mut next = Instant::now();
    loop {
        let delay = monitor.lock().await.next_delay();
        next += delay;
        // Catch up instead of bursting if a cycle overran the period
        if next < Instant::now() {
            next = Instant::now() + delay;
        }
        sleep_until(next).await;

        let now = OffsetDateTime::now_utc();
        let mut monitor = monitor.lock().await;
        match monitor.run_cycle(now).await {
            Ok(report) if report.skipped => {
                warn!("Cycle at {} skipped, capture did not stop", format_datetime(&now));
            }
            Ok(report) => {
                info!(
                    "Cycle at {}: {} frames, {} readings, {} of {} pucks seen, {} updates",
                    format_datetime(&now),
                    report.frames,
                    report.readings,
                    report.devices,
                    monitor.registry().len(),
                    report.updates
                );
                if report.spikes > 0 {
                    info!("  Dropped {} out-of-range temperature samples", report.spikes);
                }
                for mac in &report.reprogrammed {
                    info!("  Reprogrammed {}", mac);
                }
                if report.frames == 0 {
                    log!(
                        empty_cycle_level(discovery),
                        "No advertisements collected during this interval"
                    );
                }
            }
            Err(e) => error!("Aggregation cycle failed: {}", e),
        }
    }
}

/// Reflash every known puck whenever SIGUSR1 arrives
async fn reprogram_on_request(monitor: Arc<Mutex<Monitor>>) {
    let mut requests = match signal(SignalKind::user_defined1()) {
        Ok(requests) => requests,
        Err(e) => {
            error!("Failed to listen for SIGUSR1, manual reprogramming disabled: {}", e);
            return;
        }
    };

    while requests.recv().await.is_some() {
        info!("Reprogram requested");
        let flashed = monitor
            .lock()
            .await
            .reprogram_now(None, OffsetDateTime::now_utc())
            .await;
        info!("Reprogram request finished for {} puck(s)", flashed.len());
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        _ = terminate.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match MonitorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match power_on_adapters(&config.hci_interfaces).await {
        Ok(powered) if powered < config.hci_interfaces.len() => warn!(
            "Only {} of {} adapters are powered",
            powered,
            config.hci_interfaces.len()
        ),
        Ok(_) => {}
        Err(e) => warn!("Could not check adapters through BlueZ, scanning anyway: {}", e),
    }

    let capture = CaptureSession::new(
        Arc::new(HciRadio),
        CaptureSettings::from(&config),
        CaptureBuffer::new(),
    );
    let discovery = config.discovery;
    let flasher = EspruinoFlasher::new(config.espruino_path.clone(), config.firmware_path.clone());
    let mut monitor = Monitor::new(config, capture, Box::new(LogSink), Box::new(flasher));
    monitor.start_capture()?;
    let monitor = Arc::new(Mutex::new(monitor));

    tokio::spawn(reprogram_on_request(Arc::clone(&monitor)));

    tokio::select! {
        _ = main_loop(Arc::clone(&monitor), discovery) => {}
        _ = shutdown_signal() => {
            info!("Program terminated. Exiting gracefully.");
        }
    }

    if !monitor.lock().await.shutdown().await {
        warn!("Some capture workers were still running at exit");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cycles_warn_only_without_discovery() {
        assert_eq!(empty_cycle_level(true), Level::Info);
        assert_eq!(empty_cycle_level(false), Level::Warn);
    }
}
