//! String helpers for status fields: messages, sizes and percentages

/// Uppercase the first character of a message
pub fn capitalize_first_letter(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Format a byte count with binary units, e.g. `1.5Gi`
pub fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

/// Parse a percentage such as `37.5%` or `37.5`
pub fn parse_percent(progress: &str) -> Option<f64> {
    let value: f64 = progress.trim().trim_end_matches('%').trim().parse().ok()?;
    value.is_finite().then_some(value)
}

/// Map a 0-100% progress into the `[low, high]` window
///
/// Used when one import is split into stages, e.g. 0-50% for the registry
/// leg and 50-100% for the volume leg. Unparsable progress is returned as is.
pub fn scale_percentage(progress: &str, low: f64, high: f64) -> String {
    match parse_percent(progress) {
        Some(value) => {
            let clamped = value.clamp(0.0, 100.0);
            format!("{:.1}%", low + clamped * (high - low) / 100.0)
        }
        None => progress.to_string(),
    }
}

/// Parse a Kubernetes quantity such as `10Gi`, `1.5G` or `1024` into bytes
///
/// Returns `None` for malformed or negative quantities.
pub fn parse_quantity(quantity: &str) -> Option<i64> {
    const SUFFIXES: [(&str, f64); 12] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let quantity = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| quantity.strip_suffix(suffix).map(|n| (n, *m)))
        .unwrap_or((quantity, 1.0));

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).ceil() as i64)
}
