/// HCI advertising report parsing and Puck.js payload decoding
use bluer::Address;
use std::collections::HashSet;

use crate::models::{DecodedReading, Orientation, ReadingKind};

// HCI event framing constants
const HCI_EVENT_PKT: u8 = 0x04;
const HCI_EV_LE_META: u8 = 0x3E;
const LE_ADV_REPORT: u8 = 0x02;
const REPORT_HEADER_LEN: usize = 9; // event type + address type + address + data length
const RSSI_UNAVAILABLE: i8 = 127;

// Advertising data constants
const AD_MANUFACTURER_DATA: u8 = 0xFF;
pub const PUCK_MANUFACTURER_ID: u16 = 0x0590; // Espruino (Pur3 Ltd) company identifier

/// Why a frame or report did not produce a reading. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotAdvertisingReport,
    Truncated,
    NoAddress,
    NotAllowed,
    ForeignVendor { mac: Address, company: u16 },
    MalformedPayload,
}

/// Set of MAC addresses to process. Empty means every address is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    macs: HashSet<Address>,
}

impl AllowList {
    pub fn accept_all() -> Self {
        AllowList::default()
    }

    pub fn from_macs<I: IntoIterator<Item = Address>>(macs: I) -> Self {
        AllowList {
            macs: macs.into_iter().collect(),
        }
    }

    pub fn accepts(&self, mac: &Address) -> bool {
        self.macs.is_empty() || self.macs.contains(mac)
    }

    pub fn is_empty(&self) -> bool {
        self.macs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.macs.len()
    }
}

/// Battery, temperature and flag fields carried by the puck firmware
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PuckPayload {
    pub battery: u8,
    pub temperature: f64,
    pub button: bool,
    pub direction: Orientation,
}

struct AdvReport<'a> {
    address: Address,
    data: &'a [u8],
    rssi: Option<i8>,
}

/// Decode the first advertising report of a raw HCI event
///
/// Frames carrying several reports are handled by [`decode_all`]; this is the
/// single-report form the tests use.
#[cfg(test)]
pub fn decode(frame: &[u8], allow_list: &AllowList) -> Result<DecodedReading, Rejection> {
    let reports = split_reports(frame)?;
    match reports.first() {
        Some(report) => decode_report(report, allow_list),
        None => Err(Rejection::NoAddress),
    }
}

/// Decode every advertising report contained in a raw HCI event
///
/// A frame that is not an LE advertising report, or whose framing is broken,
/// yields a single rejection.
pub fn decode_all(frame: &[u8], allow_list: &AllowList) -> Vec<Result<DecodedReading, Rejection>> {
    match split_reports(frame) {
        Ok(reports) if reports.is_empty() => vec![Err(Rejection::NoAddress)],
        Ok(reports) => reports
            .iter()
            .map(|report| decode_report(report, allow_list))
            .collect(),
        Err(rejection) => vec![Err(rejection)],
    }
}

/// Split an HCI LE Meta / Advertising Report event into its reports
///
/// Layout: `[0x04][0x3E][param len][0x02][num reports]` then, per report,
/// `[event type][address type][address, 6 bytes LE][data len][data][rssi]`.
fn split_reports(frame: &[u8]) -> Result<Vec<AdvReport<'_>>, Rejection> {
    if frame.len() < 5
        || frame[0] != HCI_EVENT_PKT
        || frame[1] != HCI_EV_LE_META
        || frame[3] != LE_ADV_REPORT
    {
        return Err(Rejection::NotAdvertisingReport);
    }

    let count = frame[4] as usize;
    let mut offset = 5;
    let mut reports = Vec::with_capacity(count);

    for _ in 0..count {
        let header = frame
            .get(offset..offset + REPORT_HEADER_LEN)
            .ok_or(Rejection::Truncated)?;
        let data_len = header[8] as usize;
        let data_start = offset + REPORT_HEADER_LEN;
        let data = frame
            .get(data_start..data_start + data_len)
            .ok_or(Rejection::Truncated)?;
        let rssi = *frame
            .get(data_start + data_len)
            .ok_or(Rejection::Truncated)? as i8;

        // Addresses travel little-endian on the wire
        let mut address = [0u8; 6];
        for (i, byte) in header[2..8].iter().enumerate() {
            address[5 - i] = *byte;
        }

        reports.push(AdvReport {
            address: Address::new(address),
            data,
            rssi: (rssi != RSSI_UNAVAILABLE).then_some(rssi),
        });
        offset = data_start + data_len + 1;
    }

    Ok(reports)
}

fn decode_report(report: &AdvReport<'_>, allow_list: &AllowList) -> Result<DecodedReading, Rejection> {
    if report.address == Address::any() {
        return Err(Rejection::NoAddress);
    }
    if !allow_list.accepts(&report.address) {
        return Err(Rejection::NotAllowed);
    }

    // No manufacturer element: the device is on air but sent nothing for us
    let Some(manufacturer) = find_ad(report.data, AD_MANUFACTURER_DATA) else {
        return Ok(DecodedReading::presence(report.address, report.rssi));
    };
    if manufacturer.len() < 2 {
        return Err(Rejection::MalformedPayload);
    }

    let company = u16::from_le_bytes([manufacturer[0], manufacturer[1]]);
    if company != PUCK_MANUFACTURER_ID {
        return Err(Rejection::ForeignVendor {
            mac: report.address,
            company,
        });
    }

    let payload = decode_payload(&manufacturer[2..]).ok_or(Rejection::MalformedPayload)?;
    Ok(DecodedReading {
        mac: report.address,
        rssi: report.rssi,
        kind: ReadingKind::SensorPayload,
        temperature: Some(payload.temperature),
        battery: Some(payload.battery),
        button: Some(payload.button),
        direction: Some(payload.direction),
    })
}

/// Find the first AD element of the given type in advertising data
fn find_ad(data: &[u8], target_type: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 1 < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + 1 + len > data.len() {
            break;
        }
        if data[i + 1] == target_type {
            return Some(&data[i + 2..i + 1 + len]);
        }
        i += 1 + len;
    }
    None
}

/// Decode the ASCII manufacturer payload written by the puck firmware
///
/// The firmware advertises `pad(battery, 3) + pad(temp.toFixed(2), 4) + flags`:
/// - Bytes 0-2: Battery percentage, three ASCII digits (0-100)
/// - Bytes 3..len-1: Temperature in °C, optional '-' then 1-3 digits, '.', 2 digits
/// - Last byte: ASCII digit, bit 0 = button pressed, bit 1 = upside down
///
/// # Arguments
/// * `payload` - Manufacturer data bytes following the company identifier
///
/// # Returns
/// Some(PuckPayload) if every field is well formed, None otherwise
pub fn decode_payload(payload: &[u8]) -> Option<PuckPayload> {
    if !(8..=10).contains(&payload.len()) {
        return None;
    }

    let (battery, rest) = payload.split_at(3);
    let (temperature, flags) = rest.split_at(rest.len() - 1);

    let battery = parse_digits(battery)?;
    if battery > 100 {
        return None;
    }
    let temperature = parse_fixed_point(temperature)?;
    let flags = parse_digits(flags)?;
    if flags > 3 {
        return None;
    }

    Some(PuckPayload {
        battery: battery as u8,
        temperature,
        button: flags & 0x1 != 0,
        direction: if flags & 0x2 != 0 {
            Orientation::Flipped
        } else {
            Orientation::Normal
        },
    })
}

/// Parse a run of ASCII digits; anything else (including an empty run) fails
fn parse_digits(field: &[u8]) -> Option<u32> {
    if field.is_empty() || field.len() > 9 {
        return None;
    }
    field.iter().try_fold(0u32, |acc, byte| {
        byte.is_ascii_digit()
            .then(|| acc * 10 + u32::from(byte - b'0'))
    })
}

/// Parse `-?D{1,3}.DD` exactly, going through integer hundredths
fn parse_fixed_point(field: &[u8]) -> Option<f64> {
    let (negative, body) = match field.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, field),
    };
    let dot = body.len().checked_sub(3)?;
    if body[dot] != b'.' || dot == 0 || dot > 3 {
        return None;
    }

    let whole = parse_digits(&body[..dot])?;
    let fraction = parse_digits(&body[dot + 1..])?;
    let hundredths = (whole * 100 + fraction) as i32;
    let hundredths = if negative { -hundredths } else { hundredths };
    Some(f64::from(hundredths) / 100.0)
}
