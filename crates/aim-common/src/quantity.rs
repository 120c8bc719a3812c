//! Parsing for Kubernetes quantities and human durations
//!
//! Cache accounting works in bytes, while specs and status use Kubernetes
//! quantity strings ("500Gi", "1.5Ti", "100G"). Cleanup policies use short
//! durations ("30d", "12h", "1h30m").

use chrono::Duration;

use crate::Error;

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a storage quantity into bytes.
///
/// Accepts binary ("Gi") and decimal ("G") suffixes, fractional mantissas
/// ("1.5Ti") and bare byte counts.
pub fn parse_quantity_bytes(qty: &str) -> Result<u64, Error> {
    let qty = qty.trim();
    let invalid = || Error::validation(format!("invalid quantity '{qty}' (expected e.g. '100Gi')"));

    let (mantissa, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, mult)| qty.strip_suffix(suffix).map(|m| (m, *mult)))
        .unwrap_or((qty, 1));

    if mantissa.is_empty() {
        return Err(invalid());
    }

    if let Ok(whole) = mantissa.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    let fractional = mantissa.parse::<f64>().map_err(|_| invalid())?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(invalid());
    }
    Ok((fractional * multiplier as f64).round() as u64)
}

/// Format a byte count as the largest binary quantity that represents it exactly
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    BINARY_SUFFIXES
        .iter()
        .rev()
        .find(|(_, mult)| bytes % mult == 0)
        .map(|(suffix, mult)| format!("{}{}", bytes / mult, suffix))
        .unwrap_or_else(|| bytes.to_string())
}

/// Parse a compact duration such as "30d", "12h", "1h30m" or "45s".
///
/// Units: `w`, `d`, `h`, `m`, `s`. A bare number is read as seconds.
/// Values outside chrono's representable range are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let s = input.trim();
    let invalid =
        || Error::validation(format!("invalid duration '{s}' (expected e.g. '30d', '12h')"));
    let out_of_range = || Error::validation(format!("duration '{s}' is out of range"));

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<i64>() {
        return Duration::try_seconds(secs).ok_or_else(out_of_range);
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let part = match c {
            'w' => Duration::try_weeks(n),
            'd' => Duration::try_days(n),
            'h' => Duration::try_hours(n),
            'm' => Duration::try_minutes(n),
            's' => Duration::try_seconds(n),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(out_of_range)?;
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}
