/// Device registry: one lazily created sensor set per puck address.
///
/// Sensors are plain data owners. Values reach the outside world through the
/// [`SensorSink`] callback, which is where a UI or persistence layer plugs in.
use bluer::Address;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

use crate::config::MonitorConfig;
use crate::error::UpdateError;
use crate::models::{ReadingKind, SensorKind, SensorValue, TemperatureUnit};
use crate::utils::round_to;
use crate::watchdog::Freshness;

/// Metadata accompanying every sensor update
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub mac: String,
    pub rssi: Option<f64>,
    pub last_seen: ReadingKind,
    /// Arrival time of the newest frame behind this update
    pub last_received: Option<OffsetDateTime>,
    pub samples: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub updated: OffsetDateTime,
}

/// Identity of a sensor as announced to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub unique_id: String,
    pub name: String,
    pub kind: SensorKind,
    pub unit: Option<&'static str>,
}

/// A state change handed to the sink
#[derive(Debug)]
pub struct SensorUpdate<'a> {
    pub device_id: &'a str,
    pub sensor: &'a SensorDescriptor,
    /// Canonical value; temperatures are Celsius
    pub value: SensorValue,
    /// Value as shown to users, after unit conversion and rounding
    pub state: String,
    pub attributes: &'a Attributes,
}

/// Consumer of sensor registrations and state changes
pub trait SensorSink: Send {
    fn register(&mut self, sensors: &[SensorDescriptor]);

    /// Returns [`UpdateError::NotRegistered`] while the consumer is still
    /// setting up a freshly announced sensor.
    fn update(&mut self, update: &SensorUpdate<'_>) -> Result<(), UpdateError>;
}

/// Sink that writes every registration and state change to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl SensorSink for LogSink {
    fn register(&mut self, sensors: &[SensorDescriptor]) {
        for sensor in sensors {
            info!("Registered sensor {} ({})", sensor.name, sensor.unique_id);
        }
    }

    fn update(&mut self, update: &SensorUpdate<'_>) -> Result<(), UpdateError> {
        debug!("{} {} canonical value {}", update.device_id, update.sensor.kind, update.value);
        info!(
            "{} [{}]: {}{} (rssi {}, samples {}, last seen {})",
            update.sensor.name,
            update.device_id,
            update.state,
            update.sensor.unit.unwrap_or(""),
            update
                .attributes
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            update.attributes.samples,
            update.attributes.last_seen.as_str()
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct Sensor {
    pub descriptor: SensorDescriptor,
    state: Option<SensorValue>,
    attributes: Option<Attributes>,
}

impl Sensor {
    fn new(descriptor: SensorDescriptor) -> Self {
        Sensor {
            descriptor,
            state: None,
            attributes: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<SensorValue> {
        self.state
    }

    #[cfg(test)]
    pub fn attributes(&self) -> Option<&Attributes> {
        self.attributes.as_ref()
    }

    /// Store a new value; returns true if it differs from the previous one
    fn update(&mut self, value: SensorValue, attributes: Attributes) -> bool {
        let changed = self.state != Some(value);
        self.state = Some(value);
        self.attributes = Some(attributes);
        changed
    }
}

/// Per-address bookkeeping shared by the aggregation cycle and the watchdog
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub mac: Address,
    pub created_sensors: BTreeSet<SensorKind>,
    pub last_valid_payload_time: Option<OffsetDateTime>,
    pub last_seen_no_payload_time: Option<OffsetDateTime>,
    pub reprogram_in_progress: bool,
    pub freshness: Freshness,
    /// Start of the current grace window: first sighting, last valid payload or last reprogram
    pub grace_anchor: OffsetDateTime,
}

impl DeviceState {
    pub fn new(mac: Address, now: OffsetDateTime) -> Self {
        DeviceState {
            mac,
            created_sensors: BTreeSet::new(),
            last_valid_payload_time: None,
            last_seen_no_payload_time: None,
            reprogram_in_progress: false,
            freshness: Freshness::Fresh,
            grace_anchor: now,
        }
    }
}

#[derive(Debug)]
pub struct Device {
    pub state: DeviceState,
    pub id: String,
    unit: TemperatureUnit,
    sensors: BTreeMap<SensorKind, Sensor>,
}

impl Device {
    #[cfg(test)]
    pub fn sensor(&self, kind: SensorKind) -> Option<&Sensor> {
        self.sensors.get(&kind)
    }
}

/// How values are rendered for the sink
#[derive(Debug, Clone, Copy)]
struct Presentation {
    rounding: bool,
    decimals: u32,
    force_update: bool,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<Address, Device>,
    batt_entities: bool,
    presentation: Presentation,
}

impl DeviceRegistry {
    pub fn new(config: &MonitorConfig) -> Self {
        DeviceRegistry {
            devices: BTreeMap::new(),
            batt_entities: config.batt_entities,
            presentation: Presentation {
                rounding: config.rounding,
                decimals: config.decimals,
                force_update: config.force_update,
            },
        }
    }

    pub fn contains(&self, mac: &Address) -> bool {
        self.devices.contains_key(mac)
    }

    pub fn device(&self, mac: &Address) -> Option<&Device> {
        self.devices.get(mac)
    }

    pub fn device_mut(&mut self, mac: &Address) -> Option<&mut Device> {
        self.devices.get_mut(mac)
    }

    pub fn macs(&self) -> Vec<Address> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Return the device for `mac`, creating it and announcing its sensors on first sight
    pub fn get_or_create(
        &mut self,
        mac: Address,
        config: &MonitorConfig,
        sink: &mut dyn SensorSink,
        now: OffsetDateTime,
    ) -> &mut Device {
        let batt_entities = self.batt_entities;
        self.devices.entry(mac).or_insert_with(|| {
            let device_config = config.device(&mac);
            let unit = device_config.map(|d| d.temperature_unit).unwrap_or_default();
            let display_name = device_config
                .and_then(|d| d.name.clone())
                .unwrap_or_else(|| format!("Puck.js {}", mac));
            let id_base = mac.to_string().replace(':', "").to_lowercase();

            let mut kinds = vec![SensorKind::Temperature, SensorKind::Button, SensorKind::Direction];
            if batt_entities {
                kinds.push(SensorKind::Battery);
            }

            let mut state = DeviceState::new(mac, now);
            let mut sensors = BTreeMap::new();
            for kind in kinds {
                let descriptor = SensorDescriptor {
                    unique_id: format!("{}_{}", id_base, kind),
                    name: format!("{} {}", display_name, kind),
                    kind,
                    unit: match kind {
                        SensorKind::Temperature => Some(unit.symbol()),
                        SensorKind::Battery => Some("%"),
                        SensorKind::Button | SensorKind::Direction => None,
                    },
                };
                state.created_sensors.insert(kind);
                sensors.insert(kind, Sensor::new(descriptor));
            }

            let descriptors: Vec<SensorDescriptor> =
                sensors.values().map(|s| s.descriptor.clone()).collect();
            sink.register(&descriptors);
            info!("New puck {} registered with {} sensors", mac, descriptors.len());

            Device {
                state,
                id: mac.to_string(),
                unit,
                sensors,
            }
        })
    }

    /// Store a reduced value and forward it to the sink when it changed
    ///
    /// Returns Ok(false) when nothing was emitted: the device has no sensor of
    /// that kind (battery disabled) or the value is unchanged.
    pub fn publish(
        &mut self,
        mac: &Address,
        value: SensorValue,
        attributes: Attributes,
        sink: &mut dyn SensorSink,
    ) -> Result<bool, UpdateError> {
        let presentation = self.presentation;
        let Some(device) = self.devices.get_mut(mac) else {
            return Err(UpdateError::Failed(format!("no device {} in the registry", mac)));
        };
        let unit = device.unit;
        let Some(sensor) = device.sensors.get_mut(&value.kind()) else {
            return Ok(false);
        };

        let changed = sensor.update(value, attributes);
        if !changed && !presentation.force_update {
            return Ok(false);
        }

        let state = match value {
            SensorValue::Temperature(celsius) => {
                let shown = unit.present(celsius);
                if presentation.rounding {
                    round_to(shown, presentation.decimals).to_string()
                } else {
                    shown.to_string()
                }
            }
            other => other.to_string(),
        };

        let Some(attributes) = sensor.attributes.as_ref() else {
            return Ok(false);
        };
        sink.update(&SensorUpdate {
            device_id: &device.id,
            sensor: &sensor.descriptor,
            value,
            state,
            attributes,
        })?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    /// Sink recording everything it receives
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub registered: Vec<SensorDescriptor>,
        pub updates: Vec<(String, SensorKind, SensorValue, String)>,
        pub unregistered: BTreeSet<String>,
        pub failing: bool,
    }

    impl SensorSink for RecordingSink {
        fn register(&mut self, sensors: &[SensorDescriptor]) {
            self.registered.extend_from_slice(sensors);
        }

        fn update(&mut self, update: &SensorUpdate<'_>) -> Result<(), UpdateError> {
            if self.unregistered.contains(&update.sensor.unique_id) {
                return Err(UpdateError::NotRegistered(update.sensor.unique_id.clone()));
            }
            if self.failing {
                return Err(UpdateError::Failed("sink closed".into()));
            }
            self.updates.push((
                update.device_id.to_string(),
                update.sensor.kind,
                update.value,
                update.state.clone(),
            ));
            Ok(())
        }
    }

    fn attributes() -> Attributes {
        Attributes {
            mac: "AA:BB:CC:DD:EE:01".into(),
            rssi: Some(-60.0),
            last_seen: ReadingKind::SensorPayload,
            last_received: None,
            samples: 1,
            mean: None,
            median: None,
            updated: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn mac() -> Address {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[test]
    fn sensors_are_created_once_per_mac() {
        let config = MonitorConfig::default();
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        let now = OffsetDateTime::UNIX_EPOCH;

        registry.get_or_create(mac(), &config, &mut sink, now);
        registry.get_or_create(mac(), &config, &mut sink, now);

        assert_eq!(registry.len(), 1);
        assert_eq!(sink.registered.len(), 3);
        let ids: Vec<&str> = sink.registered.iter().map(|s| s.unique_id.as_str()).collect();
        assert!(ids.contains(&"aabbccddee01_temperature"));
        assert!(ids.contains(&"aabbccddee01_button"));
        assert!(ids.contains(&"aabbccddee01_direction"));
        assert!(!registry.device(&mac()).unwrap().state.created_sensors.contains(&SensorKind::Battery));
    }

    #[test]
    fn battery_sensor_follows_configuration_and_names_follow_devices() {
        let config = MonitorConfig {
            batt_entities: true,
            devices: vec![DeviceConfig {
                mac: mac(),
                name: Some("Kitchen".into()),
                temperature_unit: TemperatureUnit::Fahrenheit,
            }],
            ..MonitorConfig::default()
        };
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        registry.get_or_create(mac(), &config, &mut sink, OffsetDateTime::UNIX_EPOCH);

        assert_eq!(sink.registered.len(), 4);
        let temperature = sink
            .registered
            .iter()
            .find(|s| s.kind == SensorKind::Temperature)
            .unwrap();
        assert_eq!(temperature.name, "Kitchen temperature");
        assert_eq!(temperature.unit, Some("°F"));
    }

    #[test]
    fn unchanged_values_are_not_emitted_again() {
        let config = MonitorConfig::default();
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        registry.get_or_create(mac(), &config, &mut sink, OffsetDateTime::UNIX_EPOCH);

        let value = SensorValue::Button(true);
        assert!(registry.publish(&mac(), value, attributes(), &mut sink).unwrap());
        assert!(!registry.publish(&mac(), value, attributes(), &mut sink).unwrap());
        assert_eq!(sink.updates.len(), 1);
        assert_eq!(sink.updates[0].3, "on");
    }

    #[test]
    fn forced_updates_emit_unchanged_values() {
        let config = MonitorConfig {
            force_update: true,
            ..MonitorConfig::default()
        };
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        registry.get_or_create(mac(), &config, &mut sink, OffsetDateTime::UNIX_EPOCH);

        let value = SensorValue::Temperature(21.5);
        assert!(registry.publish(&mac(), value, attributes(), &mut sink).unwrap());
        assert!(registry.publish(&mac(), value, attributes(), &mut sink).unwrap());
        assert_eq!(sink.updates.len(), 2);
        assert!(sink.updates.iter().all(|u| u.2 == value && u.3 == "21.5"));
    }

    #[test]
    fn fahrenheit_is_applied_to_the_presented_state_only() {
        let config = MonitorConfig {
            devices: vec![DeviceConfig {
                mac: mac(),
                name: None,
                temperature_unit: TemperatureUnit::Fahrenheit,
            }],
            ..MonitorConfig::default()
        };
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        registry.get_or_create(mac(), &config, &mut sink, OffsetDateTime::UNIX_EPOCH);

        registry
            .publish(&mac(), SensorValue::Temperature(21.5), attributes(), &mut sink)
            .unwrap();
        let device = registry.device(&mac()).unwrap();
        assert_eq!(
            device.sensor(SensorKind::Temperature).unwrap().state(),
            Some(SensorValue::Temperature(21.5))
        );
        assert_eq!(sink.updates[0].2, SensorValue::Temperature(21.5));
        assert_eq!(sink.updates[0].3, "70.7");
    }

    #[test]
    fn battery_values_are_dropped_without_a_battery_sensor() {
        let config = MonitorConfig::default();
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        registry.get_or_create(mac(), &config, &mut sink, OffsetDateTime::UNIX_EPOCH);

        let emitted = registry
            .publish(&mac(), SensorValue::Battery(80), attributes(), &mut sink)
            .unwrap();
        assert!(!emitted);
        assert!(sink.updates.is_empty());
    }

    #[test]
    fn publishing_to_an_unknown_device_is_an_error() {
        let config = MonitorConfig::default();
        let mut registry = DeviceRegistry::new(&config);
        let mut sink = RecordingSink::default();
        let err = registry
            .publish(&mac(), SensorValue::Button(false), attributes(), &mut sink)
            .unwrap_err();
        assert!(!err.is_benign());
        assert!(sink.updates.is_empty());
    }
}
