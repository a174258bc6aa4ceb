use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::limits::*;
use crate::model::*;

use super::overlap::overlap_report;
use super::store::LedgerStore;
use super::{Engine, EngineError};

/// Saturdays and Sundays of `year`.
pub fn weekend_days(year: i32) -> impl Iterator<Item = NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, 1, 1);
    first
        .into_iter()
        .flat_map(|d| d.iter_days())
        .take_while(move |d| d.year() == year)
        .filter(|d| matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
}

fn request_title(r: &Request) -> String {
    let what = match r.kind {
        RequestKind::DiscretionaryHours => format!("{}h", r.hours),
        RequestKind::Vacation => "Vacation".to_string(),
        RequestKind::Holiday => "Holiday".to_string(),
    };
    format!("{} ({what} - {})", r.member, r.status)
}

/// Every request and holiday as a calendar entry, plus weekend entries for
/// each year in `years`. Sorted by date.
pub fn calendar_events(store: &LedgerStore, years: RangeInclusive<i32>) -> Vec<CalendarEvent> {
    let mut events: Vec<CalendarEvent> = store
        .requests()
        .map(|r| {
            let color = r.status.color();
            CalendarEvent {
                title: request_title(r),
                start: r.date,
                end: r.date,
                color,
                text_color: color.text_color(),
                source: CalendarSource::Request(r.id),
            }
        })
        .collect();

    events.extend(store.holidays().map(|h| CalendarEvent {
        title: format!("{} ({})", h.label, h.kind),
        start: h.date,
        end: h.date,
        color: ColorTag::Yellow,
        text_color: ColorTag::Yellow.text_color(),
        source: CalendarSource::Holiday(h.id),
    }));

    for year in years {
        events.extend(weekend_days(year).map(|d| CalendarEvent {
            title: "Weekend".to_string(),
            start: d,
            end: d,
            color: ColorTag::Yellow,
            text_color: ColorTag::Yellow.text_color(),
            source: CalendarSource::Weekend,
        }));
    }

    events.sort_by_key(|e| e.start);
    events
}

/// One row per current member, plus one per removed member that still has
/// requests in the ledger.
pub fn member_summaries(store: &LedgerStore) -> Vec<MemberSummary> {
    let mut rows: BTreeMap<String, MemberSummary> = store
        .members()
        .map(|m| {
            (
                m.name.clone(),
                MemberSummary {
                    name: m.name.clone(),
                    role: Some(m.role),
                    vacation_balance: Some(m.vacation_balance),
                    hour_balance: Some(m.hour_balance),
                    ..Default::default()
                },
            )
        })
        .collect();

    for r in store.requests() {
        let row = rows.entry(r.member.clone()).or_insert_with(|| MemberSummary {
            name: r.member.clone(),
            role: Some(r.role),
            ..Default::default()
        });
        match (r.kind, r.status) {
            (RequestKind::Vacation, RequestStatus::Pending) => row.vacation_pending += 1,
            (RequestKind::Vacation, RequestStatus::Rejected) => row.vacation_rejected += 1,
            (RequestKind::Vacation, _) => row.vacation_approved += 1,
            (RequestKind::DiscretionaryHours, RequestStatus::Pending) => row.hours_pending += r.hours,
            (RequestKind::DiscretionaryHours, RequestStatus::Rejected) => {
                row.hours_rejected += r.hours
            }
            (RequestKind::DiscretionaryHours, _) => row.hours_approved += r.hours,
            (RequestKind::Holiday, _) => {}
        }
        if r.status == RequestStatus::Overlapping {
            row.overlapping += 1;
        }
    }

    rows.into_values().collect()
}

fn calendar_window(reference_year: i32) -> Result<RangeInclusive<i32>, EngineError> {
    if !(MIN_YEAR..MAX_YEAR).contains(&reference_year) {
        return Err(EngineError::LimitExceeded("calendar year out of range"));
    }
    Ok(reference_year..=reference_year + 1)
}

impl Engine {
    /// Calendar entries for `reference_year` and the year after.
    pub async fn calendar(&self, reference_year: i32) -> Result<Vec<CalendarEvent>, EngineError> {
        let years = calendar_window(reference_year)?;
        Ok(calendar_events(&*self.store.read().await, years))
    }

    /// The calendar as a JSON array, in the shape calendar widgets take
    /// (`title`, `start`, `end`, `color`, `textColor`).
    pub async fn calendar_feed_json(&self, reference_year: i32) -> Result<String, EngineError> {
        let events = self.calendar(reference_year).await?;
        serde_json::to_string(&events)
            .map_err(|_| EngineError::InvalidRequest("calendar feed could not be encoded"))
    }

    pub async fn member_summaries(&self) -> Vec<MemberSummary> {
        member_summaries(&*self.store.read().await)
    }

    /// Committed requests currently over their role's overlap threshold.
    pub async fn overlap_report(&self) -> Vec<OverlapConflict> {
        overlap_report(self.store.read().await.requests(), &self.config.overlap)
    }
}
