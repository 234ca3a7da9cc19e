//! VEVENT extraction from raw iCalendar streams.
//!
//! Parsing is deliberately shallow: recurrence rules are kept verbatim and
//! zone resolution happens later, at expansion time. A malformed VEVENT is
//! logged and skipped; it never takes the rest of its source down with it.

use chrono::{NaiveDate, NaiveDateTime};
use icalendar::parser::{read_calendar, unfold, Component, Property};
use tracing::{debug, warn};

use epdcal_core::{EventInstant, Source};

use crate::error::{FeedError, FeedResult};

/// The normalized representation of one VEVENT.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub source: Source,

    pub uid: String,
    pub sequence: i32,

    pub summary: String,
    pub description: String,
    pub location: String,

    /// Start/end in their original zone representation.
    pub start: EventInstant,
    pub end: EventInstant,
    pub all_day: bool,
    /// TZID parameter captured from DTSTART, if any.
    pub start_tz: String,
    /// TZID parameter captured from DTEND, if any.
    pub end_tz: String,

    /// RRULE value verbatim; empty when the event does not recur.
    pub raw_rrule: String,
    /// EXDATE values in file order. Empty when `raw_rrule` is empty.
    pub ex_dates: Vec<EventInstant>,
    /// RECURRENCE-ID, present on override events only.
    pub recurrence_id: Option<EventInstant>,
    /// True iff `recurrence_id` is present.
    pub is_override: bool,
}

/// Parses one ICS payload into the events it contains.
///
/// Returns an error only when the stream itself is unreadable; individual
/// bad VEVENTs are skipped with a log line.
pub fn parse_ics(src: &Source, body: &[u8]) -> FeedResult<Vec<ParsedEvent>> {
    if body.is_empty() {
        return Err(FeedError::parse("empty ICS body").with_source_id(&src.id));
    }

    let text = String::from_utf8_lossy(body);
    let unfolded = unfold(&text);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| FeedError::parse(format!("unreadable ICS stream: {e}")).with_source_id(&src.id))?;

    let mut events = Vec::new();
    for component in calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
    {
        match parse_vevent(src, component) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(id = %src.id, url = %src.redacted_url(), error = %e, "skipping malformed VEVENT");
            }
        }
    }

    debug!(id = %src.id, url = %src.redacted_url(), event_count = events.len(), "ICS parse completed");
    Ok(events)
}

fn parse_vevent(src: &Source, vevent: &Component) -> FeedResult<ParsedEvent> {
    let uid = vevent
        .find_prop("UID")
        .map(|p| p.val.to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FeedError::parse("VEVENT with missing or empty UID"))?;

    let sequence = vevent
        .find_prop("SEQUENCE")
        .and_then(|p| p.val.as_ref().trim().parse::<i32>().ok())
        .unwrap_or(0);

    let summary = prop_string(vevent, "SUMMARY");
    let description = prop_string(vevent, "DESCRIPTION");
    let location = prop_string(vevent, "LOCATION");

    let dtstart = vevent
        .find_prop("DTSTART")
        .ok_or_else(|| FeedError::parse(format!("VEVENT {uid} has no DTSTART")))?;
    let start_tz = param_value(dtstart, "TZID").unwrap_or_default();
    let all_day = is_date_property(dtstart);
    let start = parse_time_property(dtstart)
        .ok_or_else(|| FeedError::parse(format!("VEVENT {uid} has unparseable DTSTART")))?;

    let (end, end_tz) = match vevent.find_prop("DTEND") {
        Some(dtend) => {
            let tz = param_value(dtend, "TZID").unwrap_or_default();
            let value = parse_time_property(dtend)
                .ok_or_else(|| FeedError::parse(format!("VEVENT {uid} has unparseable DTEND")))?;
            (value, tz)
        }
        // No DTEND: zero duration; all-day events get their 24h span at
        // expansion time.
        None => (start.clone(), start_tz.clone()),
    };

    let raw_rrule = vevent
        .find_prop("RRULE")
        .map(|p| p.val.to_string())
        .unwrap_or_default();

    // EXDATE may appear multiple times and each value may be a comma list.
    let mut ex_dates = Vec::new();
    if !raw_rrule.is_empty() {
        for prop in vevent.properties.iter().filter(|p| p.name == "EXDATE") {
            ex_dates.extend(parse_exdate_property(prop));
        }
    }

    let recurrence_id = vevent
        .find_prop("RECURRENCE-ID")
        .and_then(parse_time_property);
    let is_override = recurrence_id.is_some();

    Ok(ParsedEvent {
        source: src.clone(),
        uid,
        sequence,
        summary,
        description,
        location,
        start,
        end,
        all_day,
        start_tz,
        end_tz,
        raw_rrule,
        ex_dates,
        recurrence_id,
        is_override,
    })
}

fn prop_string(vevent: &Component, name: &str) -> String {
    vevent
        .find_prop(name)
        .map(|p| p.val.to_string())
        .unwrap_or_default()
}

fn param_value(prop: &Property, key: &str) -> Option<String> {
    prop.params
        .iter()
        .find(|p| p.key == key)
        .and_then(|p| p.val.as_ref().map(|v| v.to_string()))
}

fn is_date_property(prop: &Property) -> bool {
    let value_is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));
    value_is_date || !prop.val.as_ref().contains('T')
}

/// Parses DTSTART / DTEND / RECURRENCE-ID into an [`EventInstant`], using
/// the property's own VALUE/TZID parameters.
fn parse_time_property(prop: &Property) -> Option<EventInstant> {
    let tzid = param_value(prop, "TZID");
    parse_time_value(prop.val.as_ref(), tzid.as_deref(), is_date_property(prop))
}

/// Parses one EXDATE property (comma-separated values) in file order.
fn parse_exdate_property(prop: &Property) -> Vec<EventInstant> {
    let tzid = param_value(prop, "TZID");
    let is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            parse_time_value(part, tzid.as_deref(), is_date || !part.contains('T'))
        })
        .collect()
}

/// Accepted forms: `YYYYMMDDTHHMMSSZ` (UTC), `YYYYMMDDTHHMMSS` (local),
/// `YYYYMMDD` (date-only). A TZID parameter binds local values to a zone.
fn parse_time_value(value: &str, tzid: Option<&str>, is_date: bool) -> Option<EventInstant> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if is_date {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(EventInstant::Date);
    }

    if let Some(tz) = tzid {
        return NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .ok()
            .map(|local| EventInstant::Zoned {
                local,
                tzid: tz.to_string(),
            });
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
            .ok()
            .map(|naive| EventInstant::Utc(naive.and_utc()));
    }

    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .ok()
        .map(EventInstant::Floating)
}
