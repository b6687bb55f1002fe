//! Dose text parsing and unit canonicalization.
//!
//! `parse_quantity` turns free text such as `"0.3mL"`, `"250mcg"` or
//! `"2 sprays"` into a typed [`ParsedQuantity`]. The canonicalizer converts
//! mass units to mg and volume units to mL.

use crate::{Error, ParsedQuantity, QuantityKind, Result};

const MASS_UNITS: [&str; 4] = ["mg", "mcg", "ug", "g"];
const VOLUME_UNITS: [&str; 3] = ["ml", "cc", "ul"];

/// Parse free-text dose input into a typed quantity
///
/// The input must start with a number (plain decimal, leading-dot decimal or
/// comma-grouped thousands) followed by a unit. Only the first token after the
/// number is the unit, so `"2 sprays left nostril"` has unit `sprays`.
pub fn parse_quantity(input: &str) -> Result<ParsedQuantity> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(Error::Parse("Quantity is required.".into()));
    }

    let (number, rest) = split_leading_number(raw)
        .ok_or_else(|| Error::Parse(format!("Could not parse quantity: \"{}\"", input)))?;
    let value = parse_number(number)?;

    let unit = rest.split_whitespace().next().unwrap_or("");
    if unit.is_empty() {
        return Err(Error::Parse(
            "Missing unit (for example: \"mg\", \"mL\", \"IU\", \"sprays\").".into(),
        ));
    }

    let normalized = normalize_unit_token(unit);

    let (kind, normalized_unit) = if VOLUME_UNITS.contains(&normalized.as_str()) {
        let n = if normalized == "cc" { "ml".to_string() } else { normalized };
        (QuantityKind::Volume, n)
    } else if MASS_UNITS.contains(&normalized.as_str()) {
        let n = if normalized == "ug" { "mcg".to_string() } else { normalized };
        (QuantityKind::Mass, n)
    } else if normalized == "iu" {
        (QuantityKind::Iu, normalized)
    } else if !normalized.is_empty() && normalized.chars().all(char::is_alphabetic) {
        (QuantityKind::DeviceUnits, singularize(normalized))
    } else {
        return Err(Error::Parse(format!("Unrecognized unit: \"{}\"", unit)));
    };

    Ok(ParsedQuantity {
        kind,
        value,
        unit: unit.to_string(),
        normalized_unit,
    })
}

/// Normalize a device-unit label the same way `parse_quantity` does, so
/// calibration keys match what users type while logging.
pub fn normalize_device_unit_label(raw: &str) -> String {
    let first = raw.split_whitespace().next().unwrap_or("");
    singularize(normalize_unit_token(first))
}

/// Convert a mass to milligrams
pub fn to_canonical_mass_mg(value: f64, unit: &str) -> Result<f64> {
    if !value.is_finite() {
        return Err(Error::Unit("Mass value must be a finite number.".into()));
    }
    match canonical_unit_key(unit).as_str() {
        "mg" => Ok(value),
        "mcg" | "ug" => Ok(value / 1000.0),
        "g" => Ok(value * 1000.0),
        _ => Err(Error::Unit(format!("Unsupported mass unit: \"{}\"", unit))),
    }
}

/// Convert a volume to millilitres
pub fn to_canonical_volume_ml(value: f64, unit: &str) -> Result<f64> {
    if !value.is_finite() {
        return Err(Error::Unit("Volume value must be a finite number.".into()));
    }
    match canonical_unit_key(unit).as_str() {
        "ml" | "cc" => Ok(value),
        "ul" => Ok(value / 1000.0),
        _ => Err(Error::Unit(format!("Unsupported volume unit: \"{}\"", unit))),
    }
}

/// Split `raw` into its leading numeric token and the remainder
fn split_leading_number(raw: &str) -> Option<(&str, &str)> {
    let bytes = raw.as_bytes();
    let mut i = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }

    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let int_len = i - digits_start;

    if int_len == 0 {
        // Leading-dot decimal such as `.5`
        if bytes.get(i) != Some(&b'.') {
            return None;
        }
        let frac_len = count_digits(&bytes[i + 1..]);
        if frac_len == 0 {
            return None;
        }
        i += 1 + frac_len;
        return Some((&raw[..i], &raw[i..]));
    }

    // Comma-grouped thousands: 1-3 leading digits, then one or more `,ddd`
    if int_len <= 3 {
        while bytes.get(i) == Some(&b',') && count_digits(&bytes[i + 1..]) >= 3 {
            i += 4;
        }
    }

    if bytes.get(i) == Some(&b'.') {
        let frac_len = count_digits(&bytes[i + 1..]);
        if frac_len > 0 {
            i += 1 + frac_len;
        }
    }

    Some((&raw[..i], &raw[i..]))
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

fn parse_number(raw: &str) -> Result<f64> {
    let cleaned = raw.replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(Error::Parse(format!("Invalid number: \"{}\"", raw))),
    }
}

/// Micro sign and Greek mu both become ASCII `u`
fn normalize_ascii_micro(raw: &str) -> String {
    raw.replace(['\u{00B5}', '\u{03BC}'], "u")
}

fn normalize_unit_token(raw: &str) -> String {
    normalize_ascii_micro(raw.trim())
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '[' | ']'))
        .collect::<String>()
        .to_lowercase()
}

fn canonical_unit_key(unit: &str) -> String {
    normalize_ascii_micro(unit.trim())
        .replace(['[', ']'], "")
        .to_lowercase()
}

fn singularize(token: String) -> String {
    if token.chars().count() > 2 && token.ends_with('s') {
        token[..token.len() - 1].to_string()
    } else {
        token
    }
}
