//! Recurrence expansion: ParsedEvents in, concrete Occurrences out.
//!
//! Base events and overrides are resolved through two pre-grouped views
//! keyed by UID. Each base event expands independently; an override whose
//! RECURRENCE-ID matches a generated start (after timezone alignment)
//! replaces that one instance.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;
use tracing::{debug, warn};

use epdcal_core::{EventInstant, Occurrence};

use crate::error::{FeedError, FeedResult};
use crate::parse::ParsedEvent;

const DEFAULT_MAX_PER_EVENT: usize = 5000;

/// Controls how recurrence expansion is performed.
#[derive(Debug, Clone)]
pub struct ExpandConfig {
    /// The zone all occurrences are converted into.
    pub display_tz: Tz,
    /// Inclusive window start.
    pub range_start: DateTime<Tz>,
    /// Inclusive window end.
    pub range_end: DateTime<Tz>,
    /// Per-event cap on generated instances.
    pub max_per_event: usize,
}

impl ExpandConfig {
    pub fn new(display_tz: Tz, range_start: DateTime<Tz>, range_end: DateTime<Tz>) -> Self {
        Self {
            display_tz,
            range_start,
            range_end,
            max_per_event: DEFAULT_MAX_PER_EVENT,
        }
    }

    #[must_use]
    pub fn with_max_per_event(mut self, cap: usize) -> Self {
        self.max_per_event = if cap == 0 { DEFAULT_MAX_PER_EVENT } else { cap };
        self
    }
}

/// Expansion output: occurrences plus the UIDs that hit the cap.
#[derive(Debug, Default)]
pub struct ExpandResult {
    pub occurrences: Vec<Occurrence>,
    pub truncated_uids: Vec<String>,
}

/// Materializes occurrences for a batch of parsed events within a window.
///
/// Output order is deterministic: base events are processed in input order,
/// and each event's instances come out in chronological order.
pub fn expand_occurrences(events: &[ParsedEvent], cfg: &ExpandConfig) -> FeedResult<ExpandResult> {
    if cfg.range_end < cfg.range_start {
        return Err(FeedError::invalid_window("range_end is before range_start"));
    }

    // Overrides grouped by UID; base events keep their input order.
    let mut overrides_by_uid: HashMap<&str, Vec<&ParsedEvent>> = HashMap::new();
    for ev in events.iter().filter(|e| e.is_override) {
        overrides_by_uid.entry(ev.uid.as_str()).or_default().push(ev);
    }

    let mut result = ExpandResult::default();
    let mut truncated_seen = HashSet::new();

    for ev in events.iter().filter(|e| !e.is_override) {
        let overrides = overrides_by_uid
            .get(ev.uid.as_str())
            .map(|v| v.as_slice())
            .unwrap_or(&[]);

        let hit_cap = expand_event(ev, overrides, cfg, &mut result.occurrences);
        if hit_cap && truncated_seen.insert(ev.uid.clone()) {
            warn!(
                uid = %ev.uid,
                cap = cfg.max_per_event,
                "recurrence expansion truncated at per-event cap"
            );
            result.truncated_uids.push(ev.uid.clone());
        }
    }

    debug!(
        occurrence_count = result.occurrences.len(),
        truncated = result.truncated_uids.len(),
        "expansion completed"
    );
    Ok(result)
}

/// Expands one base event, appending into `out`. Returns true if the cap was
/// hit.
fn expand_event(
    ev: &ParsedEvent,
    overrides: &[&ParsedEvent],
    cfg: &ExpandConfig,
    out: &mut Vec<Occurrence>,
) -> bool {
    if ev.raw_rrule.is_empty() {
        expand_single(ev, overrides, cfg, out);
        return false;
    }
    expand_recurring(ev, overrides, cfg, out)
}

fn expand_single(
    ev: &ParsedEvent,
    overrides: &[&ParsedEvent],
    cfg: &ExpandConfig,
    out: &mut Vec<Occurrence>,
) {
    let (start, end) = event_span(ev, cfg.display_tz);
    if !ranges_overlap(&start, &end, cfg) {
        return;
    }

    match find_override(overrides, &start, cfg.display_tz) {
        Some(ov) => {
            let (ov_start, ov_end) = event_span(ov, cfg.display_tz);
            out.push(make_occurrence(ov, ov_start, ov_end, cfg.display_tz));
        }
        None => out.push(make_occurrence(ev, start, end, cfg.display_tz)),
    }
}

fn expand_recurring(
    ev: &ParsedEvent,
    overrides: &[&ParsedEvent],
    cfg: &ExpandConfig,
    out: &mut Vec<Occurrence>,
) -> bool {
    let event_zone = ev.start.zone(cfg.display_tz);

    let set: RRuleSet = match assemble_rule(ev, event_zone).parse() {
        Ok(set) => set,
        Err(e) => {
            warn!(uid = %ev.uid, rrule = %ev.raw_rrule, error = %e, "invalid RRULE, keeping base occurrence only");
            expand_single(ev, overrides, cfg, out);
            return false;
        }
    };

    // The rrule crate's after/before bounds are exclusive; widen by one
    // second to make the configured window inclusive.
    let rtz: rrule::Tz = Utc.into();
    let after = (cfg.range_start.with_timezone(&Utc) - Duration::seconds(1)).with_timezone(&rtz);
    let before = (cfg.range_end.with_timezone(&Utc) + Duration::seconds(1)).with_timezone(&rtz);

    let limit = cfg.max_per_event.min(u16::MAX as usize) as u16;
    let instances = set.after(after).before(before).all(limit);

    let (base_start, base_end) = event_span(ev, cfg.display_tz);
    let duration = (base_end - base_start).max(Duration::zero());

    for instance in &instances.dates {
        let occ_start = instance.with_timezone(&event_zone);
        let (occ_start, occ_end) = if ev.all_day {
            let midnight = EventInstant::Date(occ_start.date_naive()).resolve(event_zone);
            (midnight, midnight + Duration::hours(24))
        } else {
            (occ_start, occ_start + duration)
        };

        match find_override(overrides, &occ_start, cfg.display_tz) {
            Some(ov) => {
                let (ov_start, ov_end) = event_span(ov, cfg.display_tz);
                out.push(make_occurrence(ov, ov_start, ov_end, cfg.display_tz));
            }
            None => out.push(make_occurrence(ev, occ_start, occ_end, cfg.display_tz)),
        }
    }

    instances.limited
}

/// Resolves an event's own start/end to concrete instants, snapping all-day
/// events to midnight in their zone with a 24-hour span.
fn event_span(ev: &ParsedEvent, display: Tz) -> (DateTime<Tz>, DateTime<Tz>) {
    let start = ev.start.resolve(display);
    if ev.all_day {
        return (start, start + Duration::hours(24));
    }
    let end = ev.end.resolve(display);
    let end = if end < start { start } else { end };
    (start, end)
}

/// Finds an override whose RECURRENCE-ID names this start instant.
fn find_override<'a>(
    overrides: &[&'a ParsedEvent],
    start: &DateTime<Tz>,
    display: Tz,
) -> Option<&'a ParsedEvent> {
    overrides.iter().copied().find(|ov| {
        ov.recurrence_id
            .as_ref()
            .is_some_and(|rid| rid.resolve(display) == *start)
    })
}

fn make_occurrence(
    ev: &ParsedEvent,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    display: Tz,
) -> Occurrence {
    let start = start.with_timezone(&display);
    let end = end.with_timezone(&display);
    Occurrence {
        source_id: ev.source.id.clone(),
        uid: ev.uid.clone(),
        instance_key: Occurrence::key_for(&start),
        summary: ev.summary.clone(),
        description: ev.description.clone(),
        location: ev.location.clone(),
        all_day: ev.all_day,
        start,
        end,
    }
}

fn ranges_overlap(start: &DateTime<Tz>, end: &DateTime<Tz>, cfg: &ExpandConfig) -> bool {
    !(end < &cfg.range_start || start > &cfg.range_end)
}

/// Synthesizes the DTSTART/RRULE/EXDATE property block the rrule crate
/// parses into a set. Values are emitted uniformly in datetime form, with
/// zone-less values bound to the event zone.
fn assemble_rule(ev: &ParsedEvent, event_zone: Tz) -> String {
    let mut lines = Vec::with_capacity(2 + ev.ex_dates.len());
    lines.push(format!("DTSTART{}", format_instant(&ev.start, event_zone)));
    lines.push(format!("RRULE:{}", ev.raw_rrule));
    for ex in &ev.ex_dates {
        lines.push(format!("EXDATE{}", format_instant(ex, event_zone)));
    }
    lines.join("\n")
}

/// Formats an instant as an iCalendar property suffix (`;TZID=...:value` or
/// `:valueZ`), aligned to the event zone when the value itself is zone-less.
fn format_instant(instant: &EventInstant, event_zone: Tz) -> String {
    match instant {
        EventInstant::Date(d) => {
            format!(";TZID={}:{}T000000", event_zone.name(), d.format("%Y%m%d"))
        }
        EventInstant::Utc(dt) => format!(":{}", dt.format("%Y%m%dT%H%M%SZ")),
        EventInstant::Zoned { local, tzid } => {
            let zone = tzid
                .parse::<Tz>()
                .map(|z| z.name().to_string())
                .unwrap_or_else(|_| event_zone.name().to_string());
            format!(";TZID={}:{}", zone, local.format("%Y%m%dT%H%M%S"))
        }
        EventInstant::Floating(local) => {
            if event_zone == Tz::UTC {
                format!(":{}Z", local.format("%Y%m%dT%H%M%S"))
            } else {
                format!(";TZID={}:{}", event_zone.name(), local.format("%Y%m%dT%H%M%S"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_ics;
    use chrono::TimeZone;
    use epdcal_core::{rfc3339_nano, Source};

    fn seoul() -> Tz {
        "Asia/Seoul".parse().unwrap()
    }

    fn src() -> Source {
        Source::new("test", "https://example.com/feed.ics")
    }

    fn wrap(vevents: &str) -> String {
        format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\n{vevents}END:VCALENDAR\r\n")
    }

    fn parse(vevents: &str) -> Vec<ParsedEvent> {
        parse_ics(&src(), wrap(vevents).as_bytes()).unwrap()
    }

    fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> ExpandConfig {
        let tz = seoul();
        ExpandConfig::new(
            tz,
            tz.with_ymd_and_hms(start.0, start.1, start.2, 0, 0, 0).unwrap(),
            tz.with_ymd_and_hms(end.0, end.1, end.2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn rejects_inverted_window() {
        let tz = seoul();
        let cfg = ExpandConfig::new(
            tz,
            tz.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 1, 9, 0, 0, 0).unwrap(),
        );
        assert!(expand_occurrences(&[], &cfg).is_err());
    }

    #[test]
    fn single_timed_event_converts_to_display_zone() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:single@example.com\r\n\
             DTSTART:20250110T090000Z\r\n\
             DTEND:20250110T100000Z\r\n\
             SUMMARY:Call\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 9), (2025, 1, 11))).unwrap();
        assert_eq!(result.occurrences.len(), 1);
        let occ = &result.occurrences[0];
        assert!(!occ.all_day);
        assert_eq!(occ.start.to_rfc3339(), "2025-01-10T18:00:00+09:00");
        assert_eq!(occ.end.to_rfc3339(), "2025-01-10T19:00:00+09:00");
        assert_eq!(occ.instance_key, "2025-01-10T18:00:00+09:00");
    }

    #[test]
    fn daily_recurrence_with_exception() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:daily@example.com\r\n\
             DTSTART:20250101T000000Z\r\n\
             DTEND:20250101T010000Z\r\n\
             RRULE:FREQ=DAILY;COUNT=5\r\n\
             EXDATE:20250103T000000Z\r\n\
             SUMMARY:Daily\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2024, 12, 31), (2025, 1, 7))).unwrap();
        let days: Vec<u32> = result
            .occurrences
            .iter()
            .map(|o| o.start.with_timezone(&Tz::UTC).format("%d").to_string().parse().unwrap())
            .collect();
        assert_eq!(days, vec![1, 2, 4, 5]);
        assert!(result.truncated_uids.is_empty());
    }

    #[test]
    fn exdate_at_dtstart_removes_first_occurrence() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:firstgone@example.com\r\n\
             DTSTART:20250101T000000Z\r\n\
             DTEND:20250101T010000Z\r\n\
             RRULE:FREQ=DAILY;COUNT=3\r\n\
             EXDATE:20250101T000000Z\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2024, 12, 31), (2025, 1, 7))).unwrap();
        assert_eq!(result.occurrences.len(), 2);
        assert_eq!(
            result.occurrences[0].start.with_timezone(&Utc).to_rfc3339(),
            "2025-01-02T00:00:00+00:00"
        );
    }

    #[test]
    fn override_replaces_single_instance() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:weekly@example.com\r\n\
             DTSTART:20250106T100000Z\r\n\
             DTEND:20250106T110000Z\r\n\
             RRULE:FREQ=WEEKLY;BYDAY=MO;COUNT=3\r\n\
             SUMMARY:Weekly sync\r\n\
             END:VEVENT\r\n\
             BEGIN:VEVENT\r\n\
             UID:weekly@example.com\r\n\
             RECURRENCE-ID:20250113T100000Z\r\n\
             DTSTART:20250113T140000Z\r\n\
             DTEND:20250113T150000Z\r\n\
             SUMMARY:Moved\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 5), (2025, 1, 25))).unwrap();
        assert_eq!(result.occurrences.len(), 3);

        let moved: Vec<_> = result
            .occurrences
            .iter()
            .filter(|o| o.summary == "Moved")
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(
            moved[0].start.with_timezone(&Utc).to_rfc3339(),
            "2025-01-13T14:00:00+00:00"
        );

        let unchanged: Vec<_> = result
            .occurrences
            .iter()
            .filter(|o| o.summary == "Weekly sync")
            .collect();
        assert_eq!(unchanged.len(), 2);
        for occ in unchanged {
            assert_eq!(occ.start.with_timezone(&Utc).format("%H%M").to_string(), "1000");
        }
    }

    #[test]
    fn all_day_event_spans_midnight_to_midnight() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:allday@example.com\r\n\
             DTSTART;VALUE=DATE:20250201\r\n\
             SUMMARY:Holiday\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 31), (2025, 2, 3))).unwrap();
        assert_eq!(result.occurrences.len(), 1);
        let occ = &result.occurrences[0];
        assert!(occ.all_day);
        assert_eq!(occ.start.to_rfc3339(), "2025-02-01T00:00:00+09:00");
        assert_eq!(occ.end.to_rfc3339(), "2025-02-02T00:00:00+09:00");
    }

    #[test]
    fn instance_key_matches_display_start() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:key@example.com\r\n\
             DTSTART:20250110T090000Z\r\n\
             DTEND:20250110T100000Z\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 9), (2025, 1, 11))).unwrap();
        for occ in &result.occurrences {
            assert_eq!(occ.instance_key, rfc3339_nano(&occ.start));
        }
    }

    #[test]
    fn per_event_cap_records_truncation() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:forever@example.com\r\n\
             DTSTART:20250101T000000Z\r\n\
             DTEND:20250101T003000Z\r\n\
             RRULE:FREQ=DAILY\r\n\
             END:VEVENT\r\n",
        );

        let cfg = window((2025, 1, 1), (2026, 1, 1)).with_max_per_event(3);
        let result = expand_occurrences(&events, &cfg).unwrap();
        assert_eq!(result.occurrences.len(), 3);
        assert_eq!(result.truncated_uids, vec!["forever@example.com".to_string()]);
    }

    #[test]
    fn invalid_rrule_keeps_base_occurrence() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:broken@example.com\r\n\
             DTSTART:20250110T090000Z\r\n\
             DTEND:20250110T100000Z\r\n\
             RRULE:FREQ=SOMETIMES\r\n\
             SUMMARY:Broken rule\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 9), (2025, 1, 11))).unwrap();
        assert_eq!(result.occurrences.len(), 1);
        assert_eq!(result.occurrences[0].summary, "Broken rule");
    }

    #[test]
    fn out_of_window_single_event_is_dropped() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:faraway@example.com\r\n\
             DTSTART:20250610T090000Z\r\n\
             DTEND:20250610T100000Z\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 9), (2025, 1, 11))).unwrap();
        assert!(result.occurrences.is_empty());
    }

    #[test]
    fn expansion_is_deterministic() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:a@example.com\r\n\
             DTSTART:20250106T100000Z\r\n\
             DTEND:20250106T110000Z\r\n\
             RRULE:FREQ=WEEKLY;COUNT=4\r\n\
             END:VEVENT\r\n\
             BEGIN:VEVENT\r\n\
             UID:b@example.com\r\n\
             DTSTART:20250107T100000Z\r\n\
             DTEND:20250107T110000Z\r\n\
             RRULE:FREQ=DAILY;COUNT=4\r\n\
             END:VEVENT\r\n",
        );

        let cfg = window((2025, 1, 5), (2025, 2, 5));
        let first = expand_occurrences(&events, &cfg).unwrap();
        let second = expand_occurrences(&events, &cfg).unwrap();
        assert_eq!(first.occurrences, second.occurrences);

        let keys: Vec<_> = first.occurrences.iter().map(|o| &o.instance_key).collect();
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(keys.len(), unique.len());
    }

    #[test]
    fn zoned_recurrence_expands_in_its_own_zone() {
        let events = parse(
            "BEGIN:VEVENT\r\n\
             UID:ny@example.com\r\n\
             DTSTART;TZID=America/New_York:20250106T090000\r\n\
             DTEND;TZID=America/New_York:20250106T093000\r\n\
             RRULE:FREQ=WEEKLY;COUNT=2\r\n\
             END:VEVENT\r\n",
        );

        let result = expand_occurrences(&events, &window((2025, 1, 5), (2025, 1, 20))).unwrap();
        assert_eq!(result.occurrences.len(), 2);
        // 09:00 in New York (-05:00) is 23:00 in Seoul.
        assert_eq!(result.occurrences[0].start.to_rfc3339(), "2025-01-06T23:00:00+09:00");
    }
}
