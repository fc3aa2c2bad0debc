use bluer::Address;
use std::fmt;
use time::OffsetDateTime;

/// One HCI event as read from a scanning socket, stamped on arrival.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub interface: u16,
    pub received_at: OffsetDateTime,
    pub bytes: Vec<u8>,
}

impl RawFrame {
    pub fn new(interface: u16, bytes: Vec<u8>) -> Self {
        RawFrame {
            interface,
            received_at: OffsetDateTime::now_utc(),
            bytes,
        }
    }
}

/// Whether a sighting carried a puck payload or only proved the device is on air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    Presence,
    SensorPayload,
}

impl ReadingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingKind::Presence => "presence",
            ReadingKind::SensorPayload => "payload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Normal,
    Flipped,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Normal => "normal",
            Orientation::Flipped => "flipped",
        }
    }
}

/// A single decoded advertisement report
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub mac: Address,
    pub rssi: Option<i8>,
    pub kind: ReadingKind,
    pub temperature: Option<f64>,
    pub battery: Option<u8>,
    pub button: Option<bool>,
    pub direction: Option<Orientation>,
}

impl DecodedReading {
    pub fn presence(mac: Address, rssi: Option<i8>) -> Self {
        DecodedReading {
            mac,
            rssi,
            kind: ReadingKind::Presence,
            temperature: None,
            battery: None,
            button: None,
            direction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Temperature,
    Battery,
    Button,
    Direction,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Battery => "battery",
            SensorKind::Button => "button",
            SensorKind::Direction => "direction",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduced per-cycle value of one sensor. Temperature is always Celsius here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValue {
    Temperature(f64),
    Battery(u8),
    Button(bool),
    Direction(Orientation),
}

impl SensorValue {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorValue::Temperature(_) => SensorKind::Temperature,
            SensorValue::Battery(_) => SensorKind::Battery,
            SensorValue::Button(_) => SensorKind::Button,
            SensorValue::Direction(_) => SensorKind::Direction,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Temperature(t) => write!(f, "{}", t),
            SensorValue::Battery(b) => write!(f, "{}", b),
            SensorValue::Button(pressed) => f.write_str(if *pressed { "on" } else { "off" }),
            SensorValue::Direction(o) => f.write_str(o.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a canonical Celsius value into this unit
    pub fn present(self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fahrenheit_is_applied_only_on_presentation() {
        assert_eq!(TemperatureUnit::Celsius.present(21.5), 21.5);
        assert_eq!(TemperatureUnit::Fahrenheit.present(100.0), 212.0);
        assert_eq!(TemperatureUnit::Fahrenheit.present(-40.0), -40.0);
    }

    #[test]
    fn values_render_like_the_puck_states() {
        assert_eq!(SensorValue::Button(true).to_string(), "on");
        assert_eq!(SensorValue::Button(false).to_string(), "off");
        assert_eq!(
            SensorValue::Direction(Orientation::Flipped).to_string(),
            "flipped"
        );
        assert_eq!(SensorValue::Battery(87).kind(), SensorKind::Battery);
    }
}
