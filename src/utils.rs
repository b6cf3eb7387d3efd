//! Small display helpers.

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count with binary units, two decimals.
pub fn format_bytes(bytes: f64) -> String {
    let mut value = bytes.max(0.0);
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", value as u64)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Format a transfer speed in bytes/sec.
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_stay_in_integer_units() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(512.0), "512 B");
    }

    #[test]
    fn larger_values_scale_up() {
        assert_eq!(format_bytes(1024.0), "1.00 KiB");
        assert_eq!(format_bytes(1536.0), "1.50 KiB");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0), "5.00 MiB");
        assert_eq!(format_bytes(2.5 * 1024.0 * 1024.0 * 1024.0), "2.50 GiB");
    }

    #[test]
    fn speed_appends_per_second() {
        assert_eq!(format_speed(1024.0), "1.00 KiB/s");
    }
}
