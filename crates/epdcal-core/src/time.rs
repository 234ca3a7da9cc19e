//! Calendar time values as they appear on the wire.
//!
//! iCalendar start/end/exception values come in four shapes: a bare date, a
//! UTC instant, a local time bound to a TZID, and a floating local time with
//! no zone at all. [`EventInstant`] keeps the original shape so that
//! recurrence expansion can resolve zones late, the way the source intended.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

/// A start/end/exception value with its original zone information retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInstant {
    /// Date-only value (`VALUE=DATE` or a bare `YYYYMMDD`).
    Date(NaiveDate),
    /// UTC instant (`...T...Z`).
    Utc(DateTime<Utc>),
    /// Local time bound to an IANA zone via a `TZID` parameter.
    Zoned { local: NaiveDateTime, tzid: String },
    /// Local time with no zone information.
    Floating(NaiveDateTime),
}

impl EventInstant {
    /// Returns true for date-only values.
    pub fn is_date(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// The zone this instant is anchored to.
    ///
    /// Date-only values have no intrinsic zone and bind to `fallback`
    /// (the display zone); floating times are anchored to UTC, matching
    /// how the rest of the pipeline treats zone-less datetimes. A TZID
    /// that does not name a known IANA zone also falls back.
    pub fn zone(&self, fallback: Tz) -> Tz {
        match self {
            Self::Date(_) => fallback,
            Self::Utc(_) => Tz::UTC,
            Self::Zoned { tzid, .. } => tzid.parse().unwrap_or(fallback),
            Self::Floating(_) => Tz::UTC,
        }
    }

    /// Resolves this value to a concrete instant in its own zone.
    ///
    /// Dates resolve to midnight. Ambiguous local times (DST folds) take
    /// the earlier interpretation; nonexistent local times (DST gaps) are
    /// pushed to the earliest valid instant after the gap.
    pub fn resolve(&self, fallback: Tz) -> DateTime<Tz> {
        let zone = self.zone(fallback);
        match self {
            Self::Date(d) => resolve_local(zone, d.and_hms_opt(0, 0, 0).expect("midnight")),
            Self::Utc(dt) => dt.with_timezone(&zone),
            Self::Zoned { local, .. } => resolve_local(zone, *local),
            Self::Floating(local) => resolve_local(zone, *local),
        }
    }
}

fn resolve_local(zone: Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match zone.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earlier, _) => earlier,
        chrono::LocalResult::None => {
            // Local time inside a DST gap; step forward to the first
            // representable instant.
            let mut probe = local;
            loop {
                probe = probe + chrono::Duration::minutes(30);
                if let chrono::LocalResult::Single(dt) = zone.from_local_datetime(&probe) {
                    return dt;
                }
            }
        }
    }
}

/// Formats a datetime like Go's `time.RFC3339Nano`: fractional seconds are
/// printed only when non-zero, with trailing zeros elided.
pub fn rfc3339_nano<Z: TimeZone>(dt: &DateTime<Z>) -> String
where
    Z::Offset: std::fmt::Display,
{
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
