//! Human-readable byte counts.

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count with the largest unit that keeps the scaled value at
/// or under 1024, with two fractional digits.
pub fn human_bytes(bytes: f64) -> String {
    let mut value = bytes;
    let mut unit = 0;
    while value > 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::human_bytes;

    #[test]
    fn picks_the_largest_fitting_unit() {
        assert_eq!(human_bytes(0.0), "0.00 B");
        assert_eq!(human_bytes(512.0), "512.00 B");
        assert_eq!(human_bytes(1024.0), "1024.00 B");
        assert_eq!(human_bytes(2048.0), "2.00 KiB");
        assert_eq!(human_bytes(1536.0), "1.50 KiB");
        assert_eq!(human_bytes(3.0 * 1024.0 * 1024.0), "3.00 MiB");
        assert_eq!(human_bytes(5.0 * 1024.0 * 1024.0 * 1024.0), "5.00 GiB");
    }

    #[test]
    fn saturates_at_the_top_unit() {
        let huge = 4096.0 * 1024f64.powi(5);
        assert_eq!(human_bytes(huge), "4096.00 PiB");
    }
}
