//! Core domain model for the Tally scheduling-metrics pipeline.
//!
//! Everything here is platform-agnostic: adapters produce these shapes,
//! the pipeline consumes them, and the aggregation rows defined at the
//! bottom are what ultimately lands in summary tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tally-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("unparseable date bound: {0}")]
    Unparseable(String),
    #[error("start {start} is after end {end}")]
    StartAfterEnd { start: NaiveDate, end: NaiveDate },
}

/// Inclusive calendar-date range. Invariant: `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds and validate ordering before any I/O happens.
    pub fn parse(start_iso: &str, end_iso: &str) -> Result<Self, DateRangeError> {
        let start = NaiveDate::from_str(start_iso.trim())
            .map_err(|_| DateRangeError::Unparseable(start_iso.to_string()))?;
        let end = NaiveDate::from_str(end_iso.trim())
            .map_err(|_| DateRangeError::Unparseable(end_iso.to_string()))?;
        Self::new(start, end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Iterate every calendar date in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        let count = self.num_days();
        (0..count).map(move |offset| start + Duration::days(offset))
    }

    /// Split into sequential windows of at most `max_days`, each padded by
    /// `pad_days` on both ends. Padding absorbs timezone-boundary records;
    /// de-duplication by external id makes the overlap harmless.
    pub fn chunks(&self, max_days: i64, pad_days: i64) -> Vec<DateRange> {
        let max_days = max_days.max(1);
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let raw_end = (cursor + Duration::days(max_days - 1)).min(self.end);
            out.push(DateRange {
                start: cursor - Duration::days(pad_days),
                end: raw_end + Duration::days(pad_days),
            });
            cursor = raw_end + Duration::days(1);
        }
        out
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Requested rollup granularity; controls which aggregation groups run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    /// Weekly rollups run for anything coarser than a single day.
    pub fn includes_weekly(&self) -> bool {
        !matches!(self, Granularity::Day)
    }

    /// The monthly group (monthly, top-clients, service-mix, funnel) runs
    /// for month-or-coarser requests.
    pub fn includes_monthly(&self) -> bool {
        matches!(
            self,
            Granularity::Month | Granularity::Quarter | Granularity::Year
        )
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            "quarter" | "quarterly" => Ok(Granularity::Quarter),
            "year" | "yearly" => Ok(Granularity::Year),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Strip a phone number down to NANP E.164 (`+1XXXXXXXXXX`).
///
/// Accepts 11 digits with a leading `1`, bare 10 digits, or any other
/// 11-digit value whose tail is a valid 10-digit number. Anything else is
/// unusable for identity purposes, which is non-fatal for the record.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => Some(format!("+1{digits}")),
        11 if digits.starts_with('1') => Some(format!("+{digits}")),
        11 => {
            let tail = &digits[1..];
            if tail.len() == 10 {
                Some(format!("+1{tail}"))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// A name is usable for identity when both parts survive trimming with at
/// least two characters each.
pub fn is_valid_name(first: &str, last: &str) -> bool {
    first.trim().len() >= 2 && last.trim().len() >= 2
}

/// Derive a durable client key for platforms with no native customer id.
/// Precedence: lowercased email, then normalized phone, then "first last".
pub fn client_key_from_contact(
    email: Option<&str>,
    phone_e164: Option<&str>,
    first: &str,
    last: &str,
) -> Option<String> {
    if let Some(email) = email {
        let trimmed = email.trim().to_ascii_lowercase();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    if let Some(phone) = phone_e164 {
        if !phone.is_empty() {
            return Some(phone.to_string());
        }
    }
    if is_valid_name(first, last) {
        return Some(format!(
            "{} {}",
            first.trim().to_ascii_lowercase(),
            last.trim().to_ascii_lowercase()
        ));
    }
    None
}

/// Platform-specific extras carried through normalization untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentExtras {
    pub location_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub team_member_id: Option<String>,
    pub status: Option<String>,
}

/// Platform-agnostic appointment handed from adapters into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAppointment {
    /// Unique per tenant+platform.
    pub external_id: String,
    pub date: NaiveDate,
    pub datetime: Option<NaiveDateTime>,
    pub email: Option<String>,
    pub phone_raw: Option<String>,
    pub phone_e164: Option<String>,
    pub first_name: String,
    pub last_name: String,
    /// Platform-native client identity, or a contact-derived key.
    pub client_key: Option<String>,
    pub service_type: String,
    pub price: f64,
    pub tip: f64,
    pub created_at: Option<NaiveDateTime>,
    pub notes: Option<String>,
    pub referral_source: Option<String>,
    pub cancelled: bool,
    pub extras: AppointmentExtras,
}

impl NormalizedAppointment {
    /// At least one of email / normalized phone / valid name must be present
    /// or the record is unusable and dropped at normalization time.
    pub fn has_identity(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
            || self.phone_e164.is_some()
            || is_valid_name(&self.first_name, &self.last_name)
    }
}

/// Durable per-tenant client identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedClient {
    pub client_key: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub first_appt: Option<NaiveDate>,
    pub second_appt: Option<NaiveDate>,
    pub last_appt: Option<NaiveDate>,
    /// Referral/marketing source attributed to the earliest appointment.
    pub first_source: Option<String>,
    pub total_appointments: i64,
}

impl NormalizedClient {
    /// Recompute `{first, second, last}` as the extremal elements of the
    /// union of known dates plus `incoming`. Order-independent by
    /// construction: the fold goes through a sorted set.
    pub fn fold_date(&mut self, incoming: NaiveDate) {
        let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
        dates.extend(self.first_appt);
        dates.extend(self.second_appt);
        dates.extend(self.last_appt);
        dates.insert(incoming);

        let mut iter = dates.iter();
        self.first_appt = iter.next().copied();
        self.second_appt = iter.next().copied();
        self.last_appt = dates.iter().next_back().copied();
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

/// Output of the client-identity resolution step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientResolutionResult {
    /// External appointment id -> resolved client key.
    pub appointment_clients: BTreeMap<String, String>,
    pub clients: BTreeMap<String, NormalizedClient>,
    pub created_keys: BTreeSet<String>,
}

/// ISO-style Monday start of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Sunday end of the week containing `date`.
pub fn week_end(date: NaiveDate) -> NaiveDate {
    week_start(date) + Duration::days(6)
}

/// Week-number-within-month, `ceil(day_of_month / 7)`.
pub fn week_number_in_month(date: NaiveDate) -> u32 {
    date.day().div_ceil(7)
}

/// `YYYY-MM` period key used by funnel rows.
pub fn month_period(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// One row per (tenant, date). Fully recomputed on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub appointments: i64,
    pub revenue: f64,
    pub tips: f64,
}

/// One row per (tenant, week_number, month, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyStat {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub week_number: u32,
    pub month: u32,
    pub year: i32,
    pub appointments: i64,
    pub revenue: f64,
    pub new_clients: i64,
    pub returning_clients: i64,
}

/// One row per (tenant, month, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyStat {
    pub month: u32,
    pub year: i32,
    pub appointments: i64,
    pub revenue: f64,
    pub unique_clients: i64,
    pub new_clients: i64,
    pub returning_clients: i64,
    pub avg_ticket: f64,
}

/// One row per (tenant, month, year, client_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRankStat {
    pub client_key: String,
    pub client_name: String,
    pub month: u32,
    pub year: i32,
    pub total_paid: f64,
    pub visits: i64,
}

/// One row per (tenant, service_name, month, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStat {
    pub service_name: String,
    pub month: u32,
    pub year: i32,
    pub bookings: i64,
    pub revenue: f64,
}

/// One row per (tenant, source, period). Sources that are empty, "unknown",
/// or "returning client" are not acquisition events and never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStat {
    pub source: String,
    pub period: String,
    pub new_clients: i64,
    pub client_names: Vec<String>,
    pub avg_ticket: f64,
}

/// Whether a recorded source counts as a true acquisition event.
pub fn is_acquisition_source(source: &str) -> bool {
    let normalized = source.trim().to_ascii_lowercase();
    !normalized.is_empty() && normalized != "unknown" && normalized != "returning client"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::from_str(s).unwrap()
    }

    #[test]
    fn date_range_rejects_start_after_end() {
        let err = DateRange::parse("2024-02-01", "2024-01-01").unwrap_err();
        assert!(matches!(err, DateRangeError::StartAfterEnd { .. }));
    }

    #[test]
    fn date_range_rejects_garbage_bounds() {
        let err = DateRange::parse("not-a-date", "2024-01-01").unwrap_err();
        assert_eq!(err, DateRangeError::Unparseable("not-a-date".to_string()));
    }

    #[test]
    fn date_range_days_are_inclusive() {
        let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days, vec![d("2024-01-01"), d("2024-01-02"), d("2024-01-03")]);
    }

    #[test]
    fn chunking_pads_each_window_by_one_day() {
        let range = DateRange::parse("2024-01-01", "2024-03-01").unwrap();
        let chunks = range.chunks(31, 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start, d("2023-12-31"));
        assert_eq!(chunks[0].end, d("2024-02-01"));
        assert_eq!(chunks[1].start, d("2024-01-31"));
        assert_eq!(chunks[1].end, d("2024-03-02"));
    }

    #[test]
    fn short_range_is_a_single_chunk() {
        let range = DateRange::parse("2024-01-01", "2024-01-05").unwrap();
        let chunks = range.chunks(31, 1);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn phone_normalization_handles_nanp_shapes() {
        assert_eq!(
            normalize_phone("(555) 123-4567"),
            Some("+15551234567".to_string())
        );
        assert_eq!(
            normalize_phone("1-555-123-4567"),
            Some("+15551234567".to_string())
        );
        assert_eq!(
            normalize_phone("2 555 123 4567"),
            Some("+15551234567".to_string())
        );
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_phone(""), None);
    }

    #[test]
    fn identity_requires_some_contact_handle() {
        let mut appt = NormalizedAppointment {
            external_id: "x1".into(),
            date: d("2024-01-05"),
            datetime: None,
            email: None,
            phone_raw: None,
            phone_e164: None,
            first_name: "J".into(),
            last_name: "D".into(),
            client_key: None,
            service_type: "Cut".into(),
            price: 40.0,
            tip: 5.0,
            created_at: None,
            notes: None,
            referral_source: None,
            cancelled: false,
            extras: AppointmentExtras::default(),
        };
        assert!(!appt.has_identity());
        appt.email = Some("jane@example.com".into());
        assert!(appt.has_identity());
    }

    #[test]
    fn client_key_precedence_email_phone_name() {
        assert_eq!(
            client_key_from_contact(Some(" Jane@Example.com "), None, "Jane", "Doe"),
            Some("jane@example.com".to_string())
        );
        assert_eq!(
            client_key_from_contact(None, Some("+15551234567"), "Jane", "Doe"),
            Some("+15551234567".to_string())
        );
        assert_eq!(
            client_key_from_contact(None, None, "Jane", "Doe"),
            Some("jane doe".to_string())
        );
        assert_eq!(client_key_from_contact(None, None, "J", "D"), None);
    }

    #[test]
    fn fold_date_is_order_independent() {
        let base = NormalizedClient {
            client_key: "k".into(),
            email: None,
            phone: None,
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            first_appt: None,
            second_appt: None,
            last_appt: None,
            first_source: None,
            total_appointments: 0,
        };

        let mut forward = base.clone();
        forward.fold_date(d("2024-01-05"));
        forward.fold_date(d("2024-01-20"));

        let mut backward = base.clone();
        backward.fold_date(d("2024-01-20"));
        backward.fold_date(d("2024-01-05"));

        assert_eq!(forward.first_appt, backward.first_appt);
        assert_eq!(forward.second_appt, backward.second_appt);
        assert_eq!(forward.last_appt, backward.last_appt);
        assert_eq!(forward.first_appt, Some(d("2024-01-05")));
        assert_eq!(forward.last_appt, Some(d("2024-01-20")));
    }

    #[test]
    fn fold_date_keeps_invariant_with_three_dates() {
        let mut client = NormalizedClient {
            client_key: "k".into(),
            email: None,
            phone: None,
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            first_appt: Some(d("2024-02-01")),
            second_appt: Some(d("2024-03-01")),
            last_appt: Some(d("2024-03-01")),
            first_source: None,
            total_appointments: 2,
        };
        client.fold_date(d("2024-01-15"));
        assert_eq!(client.first_appt, Some(d("2024-01-15")));
        assert_eq!(client.second_appt, Some(d("2024-02-01")));
        assert_eq!(client.last_appt, Some(d("2024-03-01")));
    }

    #[test]
    fn sunday_belongs_to_monday_start_week() {
        // Sunday Jan 7 2024 -> week [Mon Jan 1, Sun Jan 7].
        let sunday = d("2024-01-07");
        assert_eq!(week_start(sunday), d("2024-01-01"));
        assert_eq!(week_end(sunday), d("2024-01-07"));
        assert_eq!(week_number_in_month(sunday), 1);
        assert_eq!(week_number_in_month(d("2024-01-08")), 2);
        assert_eq!(week_number_in_month(d("2024-01-31")), 5);
    }

    #[test]
    fn acquisition_source_filters_non_events() {
        assert!(is_acquisition_source("Instagram"));
        assert!(!is_acquisition_source(""));
        assert!(!is_acquisition_source("  "));
        assert!(!is_acquisition_source("Unknown"));
        assert!(!is_acquisition_source("Returning Client"));
    }

    #[test]
    fn granularity_gating() {
        assert!(!Granularity::Day.includes_weekly());
        assert!(Granularity::Week.includes_weekly());
        assert!(!Granularity::Week.includes_monthly());
        assert!(Granularity::Quarter.includes_weekly());
        assert!(Granularity::Quarter.includes_monthly());
        assert_eq!("Monthly".parse::<Granularity>(), Ok(Granularity::Month));
        assert!("fortnight".parse::<Granularity>().is_err());
    }
}
