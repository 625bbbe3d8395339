use std::time::Duration;

/// Human readable elapsed time for batch log lines.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    let ms = total_ms % 1000;

    match (hours, minutes, secs) {
        (h, m, _) if h > 0 => format!("{}h {}m {}s", h, m, seconds),
        (0, m, _) if m > 0 => format!("{}m {}s", m, seconds),
        (0, 0, s) if s >= 10 => format!("{}s", s),
        (0, 0, s) if s > 0 => format!("{}s {}ms", s, ms),
        // in-memory stores settle whole batches below a millisecond
        _ if total_ms == 0 => format!("{}µs", duration.as_micros()),
        _ => format!("{}ms", total_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(2_500)), "2s 500ms");
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 2m 5s");
    }
}
