/// Utility functions for reductions and formatting
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Median of the samples; the two middle values are averaged for even counts
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_median_of_samples() {
        let samples = [21.0, 21.2, 21.1, 20.9];
        assert_eq!(round_to(mean(&samples).unwrap(), 1), 21.1);
        assert_eq!(median(&samples), Some(21.05));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn rounding_keeps_requested_decimals() {
        assert_eq!(round_to(21.456, 2), 21.46);
        assert_eq!(round_to(-3.25, 0), -3.0);
        assert_eq!(round_to(19.94, 1), 19.9);
    }

    #[test]
    fn datetimes_are_formatted_for_logs() {
        let dt = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(format_datetime(&dt), "01.01.1970 - 00:00:00");
    }
}
