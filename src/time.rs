use chrono::{DateTime, FixedOffset, SecondsFormat};

const NANOS_PER_TICK: u32 = 100;
const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// Renders a timestamp without losing sub-second precision.
///
/// Values aligned to 100 ns ticks (everything the table store can hold) use
/// seven fractional digits; anything finer falls back to nanoseconds. UTC is
/// written as `Z`, other offsets as `+HH:MM`.
pub fn format_full_precision(value: &DateTime<FixedOffset>) -> String {
    let nanos = value.timestamp_subsec_nanos();
    let utc = value.offset().local_minus_utc() == 0;

    // Leap seconds carry nanos >= 1s; let chrono render those.
    if nanos >= NANOS_PER_SECOND || nanos % NANOS_PER_TICK != 0 {
        return value.to_rfc3339_opts(SecondsFormat::Nanos, utc);
    }

    let offset = if utc {
        "Z".to_string()
    } else {
        value.format("%:z").to_string()
    };
    format!(
        "{}.{:07}{}",
        value.format("%Y-%m-%dT%H:%M:%S"),
        nanos / NANOS_PER_TICK,
        offset
    )
}

pub fn parse_full_precision(text: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text)
}
