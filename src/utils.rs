use std::str::FromStr;
use std::time::Duration;

/// Parses a duration string in the format "250ms", "10s", "5m", "2h".
///
/// A bare number is interpreted as milliseconds, which is the unit used for
/// phase durations throughout the benchmark definition.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    if let Ok(millis) = u64::from_str(s) {
        return Ok(Duration::from_millis(millis));
    }

    let (value_str, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else if let Some(v) = s.strip_suffix('m') {
        (v, "m")
    } else if let Some(v) = s.strip_suffix('h') {
        (v, "h")
    } else {
        return Err(format!(
            "Unknown duration unit in '{}'. Use 'ms', 's', 'm', or 'h'.",
            s
        ));
    };

    let value = match u64::from_str(value_str.trim()) {
        Ok(v) => v,
        Err(_) => return Err(format!("Invalid numeric value in duration: '{}'", value_str)),
    };

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => unreachable!(),
    }
}

/// Ceiling integer division over u128 operands, saturating into u64.
pub fn ceil_div(numerator: u128, denominator: u128) -> u64 {
    if denominator == 0 {
        return u64::MAX;
    }
    let result = (numerator + denominator - 1) / denominator;
    u64::try_from(result).unwrap_or(u64::MAX)
}
