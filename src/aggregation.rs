/// Periodic aggregation of captured advertisements.
///
/// Every cycle pauses capture, takes the buffered frames, restarts capture and
/// then reduces the frames into one value per sensor and device. Devices that
/// are on air without sending their payload are handed to the watchdog and,
/// once stale, reflashed while capture is paused again.
use bluer::Address;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

use crate::bluetooth::{decode_all, AllowList, CaptureSession, Rejection};
use crate::config::MonitorConfig;
use crate::error::CaptureError;
use crate::models::{Orientation, RawFrame, ReadingKind, SensorValue};
use crate::registry::{Attributes, DeviceRegistry, SensorSink};
use crate::reprogram::Flasher;
use crate::utils::{mean, median, round_to};
use crate::watchdog::Watchdog;

const FIRST_RUN_DELAY_SECS: u64 = 1;

/// Per-device samples collected from one cycle's frames
#[derive(Debug, Default)]
struct Bucket {
    temperatures: Vec<f64>,
    battery: Option<u8>,
    button: Option<bool>,
    direction: Option<Orientation>,
    rssi: Vec<i8>,
    payloads: usize,
    presences: usize,
    last_seen: Option<ReadingKind>,
    last_received: Option<OffsetDateTime>,
}

/// State carried from one cycle to the next
#[derive(Debug)]
pub struct CycleContext {
    pub first_run: bool,
    pub allow_list: AllowList,
    pub registry: DeviceRegistry,
    pub watchdog: Watchdog,
}

impl CycleContext {
    pub fn new(config: &MonitorConfig) -> Self {
        CycleContext {
            first_run: true,
            allow_list: config.allow_list(),
            registry: DeviceRegistry::new(config),
            watchdog: Watchdog::new(config.grace_period),
        }
    }
}

/// What a cycle did, for the scheduler's summary log
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    /// Capture did not stop in time; nothing was drained
    pub skipped: bool,
    pub frames: usize,
    pub readings: usize,
    pub devices: usize,
    pub updates: usize,
    pub spikes: usize,
    pub reprogrammed: Vec<Address>,
}

pub struct Monitor {
    config: MonitorConfig,
    capture: CaptureSession,
    context: CycleContext,
    sink: Box<dyn SensorSink>,
    flasher: Box<dyn Flasher>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        capture: CaptureSession,
        sink: Box<dyn SensorSink>,
        flasher: Box<dyn Flasher>,
    ) -> Self {
        let context = CycleContext::new(&config);
        Monitor {
            config,
            capture,
            context,
            sink,
            flasher,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.context.registry
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.context.allow_list.is_empty() {
            info!(
                "Starting capture on {} interface(s), accepting every puck",
                self.config.hci_interfaces.len()
            );
        } else {
            info!(
                "Starting capture on {} interface(s), {} allow-listed puck(s)",
                self.config.hci_interfaces.len(),
                self.context.allow_list.len()
            );
        }
        self.capture.start()
    }

    pub async fn shutdown(&mut self) -> bool {
        self.capture.shutdown().await
    }

    /// Delay before the next cycle; the first one comes early so sensors appear quickly
    pub fn next_delay(&mut self) -> Duration {
        if self.context.first_run {
            self.context.first_run = false;
            Duration::from_secs(FIRST_RUN_DELAY_SECS)
        } else {
            Duration::from_secs(self.config.period)
        }
    }

    /// Run one aggregation cycle
    ///
    /// A failed stop leaves the buffer for the next cycle. Errors restarting
    /// capture are returned after the drained frames have been processed.
    pub async fn run_cycle(&mut self, now: OffsetDateTime) -> Result<CycleReport, CaptureError> {
        if !self.capture.stop().await {
            error!(
                "Capture did not stop in time, keeping {} buffered frames for the next cycle",
                self.capture.buffer().len()
            );
            self.capture.start()?;
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }

        let frames = self.capture.buffer().drain();
        let restarted = self.capture.start();

        let mut report = CycleReport {
            frames: frames.len(),
            ..CycleReport::default()
        };
        let buckets = self.collect(&frames, &mut report);
        let stale = self.apply(buckets, now, &mut report);
        report.reprogrammed = self.reprogram(&stale, now).await;

        restarted?;
        Ok(report)
    }

    /// Reflash the given pucks, or every known puck, right now
    pub async fn reprogram_now(&mut self, macs: Option<Vec<Address>>, now: OffsetDateTime) -> Vec<Address> {
        let macs = macs.unwrap_or_else(|| self.context.registry.macs());
        if macs.is_empty() {
            info!("Reprogram requested but no pucks are known yet");
            return Vec::new();
        }
        self.reprogram(&macs, now).await
    }

    /// Decode frames and group the readings by device
    fn collect(&self, frames: &[RawFrame], report: &mut CycleReport) -> BTreeMap<Address, Bucket> {
        let mut buckets: BTreeMap<Address, Bucket> = BTreeMap::new();

        for frame in frames {
            for decoded in decode_all(&frame.bytes, &self.context.allow_list) {
                let reading = match decoded {
                    Ok(reading) => reading,
                    Err(Rejection::ForeignVendor { mac, company }) => {
                        if self.config.report_unknown {
                            info!(
                                "Unknown manufacturer 0x{:04X} from {} on hci{}",
                                company, mac, frame.interface
                            );
                        }
                        continue;
                    }
                    Err(rejection) => {
                        debug!("Frame from hci{} rejected: {:?}", frame.interface, rejection);
                        continue;
                    }
                };
                report.readings += 1;

                let bucket = buckets.entry(reading.mac).or_default();
                bucket.last_seen = Some(reading.kind);
                if bucket.last_received.map_or(true, |t| frame.received_at > t) {
                    bucket.last_received = Some(frame.received_at);
                }
                if let Some(rssi) = reading.rssi {
                    bucket.rssi.push(rssi);
                }
                if reading.kind == ReadingKind::Presence {
                    bucket.presences += 1;
                    continue;
                }

                bucket.payloads += 1;
                if let Some(temperature) = reading.temperature {
                    if (self.config.tmin..=self.config.tmax).contains(&temperature) {
                        bucket.temperatures.push(temperature);
                    } else {
                        report.spikes += 1;
                        if self.config.log_spikes {
                            info!("Temperature spike: {} ({})", temperature, reading.mac);
                        }
                    }
                }
                if reading.battery.is_some() {
                    bucket.battery = reading.battery;
                }
                if reading.button.is_some() {
                    bucket.button = reading.button;
                }
                if reading.direction.is_some() {
                    bucket.direction = reading.direction;
                }
            }
        }

        buckets
    }

    /// Update sensors and the watchdog; returns the pucks due for reprogramming
    fn apply(
        &mut self,
        buckets: BTreeMap<Address, Bucket>,
        now: OffsetDateTime,
        report: &mut CycleReport,
    ) -> Vec<Address> {
        let mut stale = Vec::new();

        for (mac, bucket) in buckets {
            // Presence alone never creates a device unless it was configured
            let known = self.context.registry.contains(&mac) || self.config.device(&mac).is_some();
            if bucket.payloads == 0 && !known {
                continue;
            }

            self.context
                .registry
                .get_or_create(mac, &self.config, self.sink.as_mut(), now);
            report.devices += 1;

            let rssi = mean(&bucket.rssi.iter().map(|r| f64::from(*r)).collect::<Vec<_>>())
                .map(|r| round_to(r, 1));
            let base = Attributes {
                mac: mac.to_string(),
                rssi,
                last_seen: bucket.last_seen.unwrap_or(ReadingKind::Presence),
                last_received: bucket.last_received,
                samples: bucket.temperatures.len(),
                mean: None,
                median: None,
                updated: now,
            };

            if let Some((value, attributes)) = self.reduce_temperature(&bucket.temperatures, &base) {
                report.updates += usize::from(self.publish(mac, SensorValue::Temperature(value), attributes));
            }
            if let Some(battery) = bucket.battery {
                report.updates += usize::from(self.publish(mac, SensorValue::Battery(battery), base.clone()));
            }
            if let Some(button) = bucket.button {
                report.updates += usize::from(self.publish(mac, SensorValue::Button(button), base.clone()));
            }
            if let Some(direction) = bucket.direction {
                report.updates += usize::from(self.publish(mac, SensorValue::Direction(direction), base.clone()));
            }

            let watchdog = self.context.watchdog;
            let Some(device) = self.context.registry.device_mut(&mac) else {
                continue;
            };
            if bucket.payloads > 0 {
                watchdog.payload_seen(&mut device.state, now);
            } else if bucket.presences > 0 && watchdog.presence_seen(&mut device.state, now) {
                warn!(
                    "Puck {} is on air without data for more than {}s",
                    mac,
                    watchdog.grace().whole_seconds()
                );
                stale.push(mac);
            }
        }

        stale
    }

    /// Mean or median of the in-range samples, rounded if configured
    fn reduce_temperature(&self, samples: &[f64], base: &Attributes) -> Option<(f64, Attributes)> {
        let mean = mean(samples)?;
        let median = median(samples)?;
        let round = |value: f64| {
            if self.config.rounding {
                round_to(value, self.config.decimals)
            } else {
                value
            }
        };

        let value = if self.config.use_median { median } else { mean };
        let attributes = Attributes {
            mean: Some(round(mean)),
            median: Some(round(median)),
            ..base.clone()
        };
        Some((round(value), attributes))
    }

    /// Forward one value, treating registration races as success
    fn publish(&mut self, mac: Address, value: SensorValue, attributes: Attributes) -> bool {
        match self
            .context
            .registry
            .publish(&mac, value, attributes, self.sink.as_mut())
        {
            Ok(emitted) => emitted,
            Err(e) if e.is_benign() => {
                debug!("Skipping {} update for {}: {}", value.kind(), mac, e);
                false
            }
            Err(e) => {
                error!("Failed to update {} sensor of {}: {}", value.kind(), mac, e);
                false
            }
        }
    }

    /// Pause capture, run the flashing tool for each puck, resume capture
    async fn reprogram(&mut self, macs: &[Address], now: OffsetDateTime) -> Vec<Address> {
        if macs.is_empty() {
            return Vec::new();
        }
        if !self.capture.stop().await {
            error!("Capture did not pause, postponing reprogramming of {} puck(s)", macs.len());
            if let Err(e) = self.capture.start() {
                error!("Failed to resume capture: {}", e);
            }
            return Vec::new();
        }

        let mut attempted = Vec::with_capacity(macs.len());
        for mac in macs {
            if let Some(device) = self.context.registry.device_mut(mac) {
                device.state.reprogram_in_progress = true;
            }

            if let Err(e) = self.flasher.flash(*mac).await {
                error!("Reprogramming puck {} failed: {}", mac, e);
            }

            let watchdog = self.context.watchdog;
            if let Some(device) = self.context.registry.device_mut(mac) {
                watchdog.reprogram_attempted(&mut device.state, now);
            }
            attempted.push(*mac);
        }

        if let Err(e) = self.capture.start() {
            error!("Failed to resume capture after reprogramming: {}", e);
        }
        attempted
    }
}
