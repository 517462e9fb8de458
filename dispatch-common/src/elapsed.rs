use chrono::Utc;

/// Returns a string representing the elapsed time since `start_time`, like
/// " in 1m15s" or " in 1.50s". Used in startup/shutdown log lines.
pub fn format_elapsed(start_time: chrono::DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(start_time);
    format_duration(elapsed)
}

fn format_duration(elapsed: chrono::TimeDelta) -> String {
    let millis = elapsed.num_milliseconds();
    if millis < 1000 {
        format!(" in {millis}ms")
    } else if millis < 60_000 {
        format!(" in {:.2}s", millis as f64 / 1000.0)
    } else {
        let minutes = millis / 60_000;
        let seconds = (millis % 60_000) / 1000;
        format!(" in {minutes}m{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::Duration;

    #[test]
    fn subsecond_durations_use_milliseconds() {
        assert_eq!(format_duration(Duration::milliseconds(250)), " in 250ms");
        assert_eq!(format_duration(Duration::milliseconds(0)), " in 0ms");
    }

    #[test]
    fn second_durations_use_two_decimals() {
        assert_eq!(format_duration(Duration::milliseconds(1_500)), " in 1.50s");
        assert_eq!(format_duration(Duration::milliseconds(59_999)), " in 60.00s");
    }

    #[test]
    fn minute_durations_use_mmss() {
        assert_eq!(format_duration(Duration::milliseconds(75_000)), " in 1m15s");
        assert_eq!(format_duration(Duration::milliseconds(60_000)), " in 1m0s");
    }
}
