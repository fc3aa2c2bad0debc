use bluer::Address;
use log::{debug, info};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::bluetooth::decoder::AllowList;
use crate::error::ConfigError;
use crate::models::TemperatureUnit;

const PREFIX: &str = "PUCK_";

/// A configured puck, optionally with a friendly name and display unit
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub mac: Address,
    pub name: Option<String>,
    pub temperature_unit: TemperatureUnit,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub rounding: bool,
    pub decimals: u32,
    pub period: u64,
    pub log_spikes: bool,
    pub use_median: bool,
    pub active_scan: bool,
    pub hci_interfaces: Vec<u16>,
    pub batt_entities: bool,
    pub report_unknown: bool,
    pub discovery: bool,
    pub devices: Vec<DeviceConfig>,
    pub espruino_path: PathBuf,
    pub firmware_path: PathBuf,
    pub grace_period: u64,
    pub scan_timeout: u64,
    pub force_update: bool,
    pub tmin: f64,
    pub tmax: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            rounding: true,
            decimals: 1,
            period: 60,
            log_spikes: false,
            use_median: false,
            active_scan: false,
            hci_interfaces: vec![0],
            batt_entities: false,
            report_unknown: false,
            discovery: true,
            devices: Vec::new(),
            espruino_path: PathBuf::from("/usr/bin/espruino"),
            firmware_path: PathBuf::from("ha-puck.js"),
            grace_period: 60,
            scan_timeout: 10,
            force_update: false,
            tmin: -40.0,
            tmax: 60.0,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_vars(&env::vars().collect())
    }

    /// Build the configuration from a snapshot of environment variables
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = MonitorConfig::default();
        let get = |key: &str| vars.get(&format!("{}{}", PREFIX, key)).map(|v| v.trim());

        let config = MonitorConfig {
            rounding: parse_var(get("ROUNDING"), "ROUNDING", parse_bool)?.unwrap_or(defaults.rounding),
            decimals: parse_var(get("DECIMALS"), "DECIMALS", parse_number)?.unwrap_or(defaults.decimals),
            period: parse_var(get("PERIOD"), "PERIOD", parse_number)?.unwrap_or(defaults.period),
            log_spikes: parse_var(get("LOG_SPIKES"), "LOG_SPIKES", parse_bool)?.unwrap_or(defaults.log_spikes),
            use_median: parse_var(get("USE_MEDIAN"), "USE_MEDIAN", parse_bool)?.unwrap_or(defaults.use_median),
            active_scan: parse_var(get("ACTIVE_SCAN"), "ACTIVE_SCAN", parse_bool)?.unwrap_or(defaults.active_scan),
            hci_interfaces: parse_var(get("HCI_INTERFACE"), "HCI_INTERFACE", parse_interfaces)?
                .unwrap_or(defaults.hci_interfaces),
            batt_entities: parse_var(get("BATT_ENTITIES"), "BATT_ENTITIES", parse_bool)?
                .unwrap_or(defaults.batt_entities),
            report_unknown: parse_var(get("REPORT_UNKNOWN"), "REPORT_UNKNOWN", parse_bool)?
                .unwrap_or(defaults.report_unknown),
            discovery: parse_var(get("DISCOVERY"), "DISCOVERY", parse_bool)?.unwrap_or(defaults.discovery),
            devices: load_devices(vars)?,
            espruino_path: get("ESPRUINO_PATH").map(PathBuf::from).unwrap_or(defaults.espruino_path),
            firmware_path: get("FIRMWARE_PATH").map(PathBuf::from).unwrap_or(defaults.firmware_path),
            grace_period: parse_var(get("GRACE_PERIOD"), "GRACE_PERIOD", parse_number)?
                .unwrap_or(defaults.grace_period),
            scan_timeout: parse_var(get("SCAN_TIMEOUT"), "SCAN_TIMEOUT", parse_number)?
                .unwrap_or(defaults.scan_timeout),
            force_update: parse_var(get("FORCE_UPDATE"), "FORCE_UPDATE", parse_bool)?
                .unwrap_or(defaults.force_update),
            tmin: parse_var(get("TMIN"), "TMIN", parse_number)?.unwrap_or(defaults.tmin),
            tmax: parse_var(get("TMAX"), "TMAX", parse_number)?.unwrap_or(defaults.tmax),
        };

        config.validate()?;

        info!("Total pucks configured: {}", config.devices.len());
        for device in &config.devices {
            info!(
                "Puck: {} -> {}",
                device.mac,
                device.name.as_deref().unwrap_or("(unnamed)")
            );
        }
        if config.grace_period < config.period {
            info!(
                "Grace period {}s is shorter than the {}s period; staleness is only judged once per cycle",
                config.grace_period, config.period
            );
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.decimals > 6 {
            return Err(ConfigError::Validation(format!(
                "{}DECIMALS must be at most 6, got {}",
                PREFIX, self.decimals
            )));
        }
        if self.period == 0 || self.scan_timeout == 0 {
            return Err(ConfigError::Validation(format!(
                "{0}PERIOD and {0}SCAN_TIMEOUT must be at least one second",
                PREFIX
            )));
        }
        if self.tmin >= self.tmax {
            return Err(ConfigError::Validation(format!(
                "{0}TMIN ({1}) must be below {0}TMAX ({2})",
                PREFIX, self.tmin, self.tmax
            )));
        }
        if self.hci_interfaces.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}HCI_INTERFACE lists no interfaces",
                PREFIX
            )));
        }
        if !self.discovery && self.devices.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Discovery is disabled and no pucks are configured. Set {0}DEVICES or {0}DEVICE_<N>_MAC",
                PREFIX
            )));
        }
        Ok(())
    }

    /// MAC addresses eligible for processing; empty in discovery mode
    pub fn allow_list(&self) -> AllowList {
        if self.discovery {
            AllowList::accept_all()
        } else {
            AllowList::from_macs(self.devices.iter().map(|d| d.mac))
        }
    }

    pub fn device(&self, mac: &Address) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.mac == *mac)
    }
}

fn parse_var<T>(
    value: Option<&str>,
    key: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        None | Some("") => Ok(None),
        Some(value) => parse(value).map(Some).map_err(|reason| ConfigError::Invalid {
            var: format!("{}{}", PREFIX, key),
            value: value.to_string(),
            reason,
        }),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

fn parse_number<T: FromStr>(value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| e.to_string())
}

fn parse_interfaces(value: &str) -> Result<Vec<u16>, String> {
    let mut interfaces = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let index = part.strip_prefix("hci").unwrap_or(part);
        let index: u16 = index
            .parse()
            .map_err(|_| format!("'{}' is not an interface index", part))?;
        if !interfaces.contains(&index) {
            interfaces.push(index);
        }
    }
    Ok(interfaces)
}

fn parse_mac(value: &str) -> Result<Address, String> {
    value
        .trim()
        .to_uppercase()
        .parse()
        .map_err(|_| format!("'{}' is not a MAC address", value.trim()))
}

fn parse_unit(value: &str) -> Result<TemperatureUnit, String> {
    match value.trim().to_ascii_uppercase().as_str() {
        "C" | "CELSIUS" | "°C" => Ok(TemperatureUnit::Celsius),
        "F" | "FAHRENHEIT" | "°F" => Ok(TemperatureUnit::Fahrenheit),
        other => Err(format!("unknown temperature unit '{}'", other)),
    }
}

/// Parse one `mac[=name[:unit]]` entry of PUCK_DEVICES
fn parse_device_entry(entry: &str) -> Result<DeviceConfig, String> {
    let (mac, rest) = match entry.split_once('=') {
        Some((mac, rest)) => (mac, rest.trim()),
        None => (entry, ""),
    };

    let (name, unit) = match rest.rsplit_once(':') {
        Some((name, unit)) if parse_unit(unit).is_ok() => (name.trim(), parse_unit(unit)?),
        _ => (rest, TemperatureUnit::default()),
    };

    Ok(DeviceConfig {
        mac: parse_mac(mac)?,
        name: (!name.is_empty()).then(|| name.to_string()),
        temperature_unit: unit,
    })
}

fn load_devices(vars: &HashMap<String, String>) -> Result<Vec<DeviceConfig>, ConfigError> {
    let mut devices: Vec<DeviceConfig> = Vec::new();
    let devices_key = format!("{}DEVICES", PREFIX);

    // Try PUCK_DEVICES format first
    if let Some(list) = vars.get(&devices_key) {
        debug!("Found {}: '{}'", devices_key, list);
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let device = parse_device_entry(entry).map_err(|reason| ConfigError::Invalid {
                var: devices_key.clone(),
                value: entry.to_string(),
                reason,
            })?;
            push_unique(&mut devices, device);
        }
    } else {
        // Fallback to individual environment variables
        let mut indexed: Vec<(&str, &String)> = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix("PUCK_DEVICE_")
                    .and_then(|s| s.strip_suffix("_MAC"))
                    .map(|index| (index, value))
            })
            .collect();
        indexed.sort();

        for (index, mac) in indexed {
            let var = |suffix: &str| format!("PUCK_DEVICE_{}_{}", index, suffix);
            let invalid = |suffix: &str, value: &str, reason: String| ConfigError::Invalid {
                var: var(suffix),
                value: value.to_string(),
                reason,
            };

            let temperature_unit = match vars.get(&var("UNIT")) {
                Some(unit) => parse_unit(unit).map_err(|r| invalid("UNIT", unit.as_str(), r))?,
                None => TemperatureUnit::default(),
            };
            let device = DeviceConfig {
                mac: parse_mac(mac).map_err(|r| invalid("MAC", mac.as_str(), r))?,
                name: vars
                    .get(&var("NAME"))
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty()),
                temperature_unit,
            };
            push_unique(&mut devices, device);
        }
    }

    Ok(devices)
}

fn push_unique(devices: &mut Vec<DeviceConfig>, device: DeviceConfig) {
    if devices.iter().any(|d| d.mac == device.mac) {
        debug!("Ignoring duplicate puck {}", device.mac);
        return;
    }
    devices.push(device);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_the_integration() {
        let config = MonitorConfig::from_vars(&HashMap::new()).unwrap();
        assert!(config.rounding);
        assert_eq!(config.decimals, 1);
        assert_eq!(config.period, 60);
        assert_eq!(config.hci_interfaces, vec![0]);
        assert!(config.discovery);
        assert_eq!(config.grace_period, 60);
        assert_eq!(config.espruino_path, PathBuf::from("/usr/bin/espruino"));
        assert!(config.allow_list().is_empty());
    }

    #[test]
    fn devices_list_is_normalized_and_deduplicated() {
        let config = MonitorConfig::from_vars(&vars(&[
            ("PUCK_DEVICES", "aa:bb:cc:dd:ee:01=Kitchen:F, AA:BB:CC:DD:EE:01=Again, aa:bb:cc:dd:ee:02"),
            ("PUCK_DISCOVERY", "false"),
        ]))
        .unwrap();

        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].mac.to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!(config.devices[0].name.as_deref(), Some("Kitchen"));
        assert_eq!(config.devices[0].temperature_unit, TemperatureUnit::Fahrenheit);
        assert_eq!(config.devices[1].name, None);
        assert_eq!(config.allow_list().len(), 2);
    }

    #[test]
    fn names_may_contain_colons_without_a_unit() {
        let device = parse_device_entry("AA:BB:CC:DD:EE:01=Desk: left").unwrap();
        assert_eq!(device.name.as_deref(), Some("Desk: left"));
        assert_eq!(device.temperature_unit, TemperatureUnit::Celsius);
    }

    #[test]
    fn indexed_device_variables_are_a_fallback() {
        let config = MonitorConfig::from_vars(&vars(&[
            ("PUCK_DEVICE_1_MAC", "aa:bb:cc:dd:ee:03"),
            ("PUCK_DEVICE_1_NAME", "Garage"),
            ("PUCK_DEVICE_1_UNIT", "f"),
        ]))
        .unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].name.as_deref(), Some("Garage"));
        assert_eq!(config.devices[0].temperature_unit, TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn scalar_options_are_parsed() {
        let config = MonitorConfig::from_vars(&vars(&[
            ("PUCK_USE_MEDIAN", "yes"),
            ("PUCK_ROUNDING", "off"),
            ("PUCK_HCI_INTERFACE", "hci0, 1,1"),
            ("PUCK_PERIOD", "30"),
            ("PUCK_GRACE_PERIOD", "120"),
            ("PUCK_TMAX", "45.5"),
        ]))
        .unwrap();

        assert!(config.use_median);
        assert!(!config.rounding);
        assert_eq!(config.hci_interfaces, vec![0, 1]);
        assert_eq!(config.period, 30);
        assert_eq!(config.grace_period, 120);
        assert_eq!(config.tmax, 45.5);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = MonitorConfig::from_vars(&vars(&[("PUCK_PERIOD", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "PUCK_PERIOD"));

        let err = MonitorConfig::from_vars(&vars(&[("PUCK_DEVICES", "not-a-mac=Desk")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "PUCK_DEVICES"));
    }

    #[test]
    fn inconsistent_configuration_is_rejected() {
        assert!(matches!(
            MonitorConfig::from_vars(&vars(&[("PUCK_DISCOVERY", "false")])),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            MonitorConfig::from_vars(&vars(&[("PUCK_TMIN", "70")])),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            MonitorConfig::from_vars(&vars(&[("PUCK_DECIMALS", "9")])),
            Err(ConfigError::Validation(_))
        ));
    }
}
