//! Kubernetes resource quantities (`500m`, `0.5`, `128Mi`, `1e3`).

use crate::prelude::*;

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Numeric value of a quantity string.
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let invalid = || PodlensError::validation(format!("`{raw}` is not a valid resource quantity"));
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (number, multiplier) = split_suffix(trimmed);
    if number.is_empty()
        || !number
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'+' | b'-' | b'e' | b'E'))
    {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let scaled = value * multiplier;
    if !scaled.is_finite() || scaled < 0.0 {
        return Err(invalid());
    }
    Ok(scaled)
}

fn split_suffix(raw: &str) -> (&str, f64) {
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, multiplier);
        }
    }
    // `E` is both the exa suffix and an exponent marker; `1E3` is an exponent.
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            if suffix == "E" && number.bytes().any(|b| b == b'e' || b == b'E') {
                continue;
            }
            return (number, multiplier);
        }
    }
    (raw, 1.0)
}

/// Compares by value so `500m` equals `0.5` and `1Gi` equals `1024Mi`.
pub fn quantities_equal(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Ok(a), Ok(b)) => {
            let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
            (a - b).abs() / scale < 1e-9
        }
        _ => a.trim() == b.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_and_memory_forms() {
        assert_eq!(parse_quantity("500m").unwrap(), 0.5);
        assert_eq!(parse_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_quantity("128Mi").unwrap(), 134_217_728.0);
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("2E").unwrap(), 2e18);
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "m", "abc", "12Zi", "-1", "1.2.3Mi"] {
            assert!(parse_quantity(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn equality_is_by_value() {
        assert!(quantities_equal("500m", "0.5"));
        assert!(quantities_equal("1Gi", "1024Mi"));
        assert!(quantities_equal("1000m", "1"));
        assert!(!quantities_equal("250m", "0.5"));
        assert!(!quantities_equal("128Mi", "128M"));
    }
}
