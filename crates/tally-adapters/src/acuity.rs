//! Acuity-style single-calendar adapter.
//!
//! Fetches day-by-day across the range (stopping at today), paginating each
//! day with an offset/limit cursor until a short page signals end-of-data.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;

use tally_core::{
    client_key_from_contact, normalize_phone, AppointmentExtras, DateRange, NormalizedAppointment,
};
use tally_store::http::ApiClient;
use tally_store::{CredentialRow, Store};

use crate::{
    dedup_by_external_id, AdapterError, FetchOutcome, OffsetPager, PlatformAdapter,
    ResourceSelector,
};

const PLATFORM: &str = "acuity";
const PAGE_LIMIT: usize = 100;
const DEFAULT_BASE_URL: &str = "https://acuityscheduling.com/api/v1";
const DEFAULT_TOKEN_EXPIRY_SECS: i64 = 3600;

pub struct AcuityAdapter {
    http: ApiClient,
    base_url: String,
}

impl AcuityAdapter {
    pub fn new(http: ApiClient) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn refresh_token(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        stale: &CredentialRow,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/oauth2/token", self.base_url);
        let response = self
            .http
            .post_form(
                &url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", &stale.refresh_token),
                ],
            )
            .await
            .map_err(|err| AdapterError::TokenRefreshFailed {
                tenant: tenant_id.to_string(),
                platform: PLATFORM.to_string(),
                reason: err.to_string(),
            })?;

        let access_token = json_str(&response, "access_token")
            .ok_or_else(|| AdapterError::TokenRefreshFailed {
                tenant: tenant_id.to_string(),
                platform: PLATFORM.to_string(),
                reason: "response missing access_token".to_string(),
            })?
            .to_string();
        let refresh_token = json_str(&response, "refresh_token")
            .map(ToString::to_string)
            .unwrap_or_else(|| stale.refresh_token.clone());
        let expires_in = response
            .get("expires_in")
            .and_then(JsonValue::as_i64)
            .unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);

        let now = Utc::now();
        let refreshed = CredentialRow {
            tenant_id: tenant_id.to_string(),
            platform: PLATFORM.to_string(),
            access_token: access_token.clone(),
            refresh_token,
            expires_at: now + Duration::seconds(expires_in),
            updated_at: now,
        };
        store.save_credential(&refreshed).await?;
        Ok(access_token)
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for AcuityAdapter {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn ensure_valid_token(
        &self,
        store: &dyn Store,
        tenant_id: &str,
    ) -> Result<String, AdapterError> {
        let credential = store.credential(tenant_id, PLATFORM).await?.ok_or_else(|| {
            AdapterError::ConnectionMissing {
                tenant: tenant_id.to_string(),
                platform: PLATFORM.to_string(),
            }
        })?;

        if !credential.is_expired(Utc::now()) {
            return Ok(credential.access_token);
        }
        self.refresh_token(store, tenant_id, &credential).await
    }

    async fn resolve_calendars(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        token: &str,
    ) -> Result<ResourceSelector, AdapterError> {
        let wanted = store
            .tenant_profile(tenant_id)
            .await?
            .and_then(|p| p.calendar_name)
            .ok_or_else(|| AdapterError::CalendarNotFound {
                platform: PLATFORM.to_string(),
                name: "<unset>".to_string(),
            })?;

        let url = format!("{}/calendars", self.base_url);
        let response = self.http.get_json(&url, &[], &[], Some(token)).await?;
        let calendars = response
            .as_array()
            .ok_or_else(|| AdapterError::Malformed {
                platform: PLATFORM.to_string(),
                detail: "calendar listing is not an array".to_string(),
            })?;

        match find_calendar_id(calendars, &wanted) {
            Some(id) => Ok(ResourceSelector::Calendar { id }),
            None => Err(AdapterError::CalendarNotFound {
                platform: PLATFORM.to_string(),
                name: wanted,
            }),
        }
    }

    async fn fetch_appointments(
        &self,
        token: &str,
        selector: &ResourceSelector,
        range: DateRange,
    ) -> Result<FetchOutcome, AdapterError> {
        let ResourceSelector::Calendar { id: calendar_id } = selector else {
            return Err(AdapterError::Malformed {
                platform: PLATFORM.to_string(),
                detail: "expected a calendar selector".to_string(),
            });
        };

        let today = Utc::now().date_naive();
        let url = format!("{}/appointments", self.base_url);
        let mut appointments = Vec::new();
        let mut pages_fetched = 0usize;
        let mut partial = false;

        for day in range.days() {
            if day > today {
                break;
            }

            let mut pager = OffsetPager::new(PAGE_LIMIT);
            loop {
                let query = [
                    ("minDate", day.to_string()),
                    ("maxDate", day.to_string()),
                    ("calendarID", calendar_id.clone()),
                    ("max", PAGE_LIMIT.to_string()),
                    ("offset", pager.offset.to_string()),
                ];
                let page = match self.http.get_json(&url, &query, &[], Some(token)).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(date = %day, error = %err, "appointment page fetch failed; stopping this day early");
                        partial = true;
                        break;
                    }
                };

                let Some(records) = page.as_array() else {
                    warn!(date = %day, "appointment page was not an array; stopping this day early");
                    partial = true;
                    break;
                };
                pages_fetched += 1;

                appointments.extend(
                    records
                        .iter()
                        .filter_map(|record| normalize_appointment(record, today)),
                );

                if !pager.advance(records.len()) {
                    break;
                }
            }
        }

        Ok(FetchOutcome {
            appointments: dedup_by_external_id(appointments),
            pages_fetched,
            partial,
        })
    }
}

fn find_calendar_id(calendars: &[JsonValue], wanted: &str) -> Option<String> {
    let wanted = wanted.trim();
    calendars.iter().find_map(|calendar| {
        let name = json_str(calendar, "name")?;
        if name.trim().eq_ignore_ascii_case(wanted) {
            json_id(calendar, "id")
        } else {
            None
        }
    })
}

/// Normalize one raw appointment record. Returns `None` for records with no
/// usable identity, cancelled-and-empty ids, or future dates.
pub fn normalize_appointment(record: &JsonValue, today: NaiveDate) -> Option<NormalizedAppointment> {
    let external_id = json_id(record, "id")?;
    let datetime = json_str(record, "datetime").and_then(parse_offset_datetime);
    let date = datetime
        .map(|dt| dt.date_naive())
        .or_else(|| json_str(record, "date").and_then(|d| d.parse().ok()))?;
    if date > today {
        return None;
    }

    let email = json_str(record, "email")
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(ToString::to_string);
    let phone_raw = json_str(record, "phone")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string);
    let phone_e164 = phone_raw.as_deref().and_then(normalize_phone);
    let first_name = json_str(record, "firstName").unwrap_or_default().to_string();
    let last_name = json_str(record, "lastName").unwrap_or_default().to_string();
    let client_key = client_key_from_contact(
        email.as_deref(),
        phone_e164.as_deref(),
        &first_name,
        &last_name,
    );

    let appointment = NormalizedAppointment {
        external_id,
        date,
        datetime: datetime.map(|dt| dt.naive_local()),
        email,
        phone_raw,
        phone_e164,
        first_name,
        last_name,
        client_key,
        service_type: json_str(record, "type").unwrap_or("Appointment").to_string(),
        price: json_amount(record, "price").unwrap_or(0.0),
        tip: json_amount(record, "tip").unwrap_or(0.0),
        created_at: json_str(record, "datetimeCreated")
            .and_then(parse_offset_datetime)
            .map(|dt| dt.naive_local()),
        notes: json_str(record, "notes")
            .filter(|n| !n.trim().is_empty())
            .map(ToString::to_string),
        referral_source: referral_from_forms(record),
        cancelled: record
            .get("canceled")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
        extras: AppointmentExtras {
            location_id: json_id(record, "calendarID"),
            ..AppointmentExtras::default()
        },
    };

    if appointment.has_identity() {
        Some(appointment)
    } else {
        None
    }
}

/// Intake forms carry the "how did you hear about us" answer; the first
/// field whose label mentions hearing/referral wins.
fn referral_from_forms(record: &JsonValue) -> Option<String> {
    let forms = record.get("forms")?.as_array()?;
    for form in forms {
        let Some(values) = form.get("values").and_then(JsonValue::as_array) else {
            continue;
        };
        for field in values {
            let name = json_str(field, "name").unwrap_or_default().to_ascii_lowercase();
            if name.contains("hear") || name.contains("referr") {
                let value = json_str(field, "value")?.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn parse_offset_datetime(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

/// Ids come back as numbers or strings depending on endpoint version.
fn json_id(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Money fields come back as numbers or "40.00"-style strings.
fn json_amount(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    #[test]
    fn normalizes_a_full_record() {
        let record = json!({
            "id": 9001,
            "datetime": "2024-01-05T10:00:00-0800",
            "email": "jane@example.com",
            "phone": "(555) 123-4567",
            "firstName": "Jane",
            "lastName": "Doe",
            "type": "Haircut",
            "price": "45.00",
            "tip": 5,
            "datetimeCreated": "2024-01-02T08:00:00-0800",
            "notes": "prefers mornings",
            "canceled": false,
            "calendarID": 77,
            "forms": [{
                "values": [
                    {"name": "How did you hear about us?", "value": "Instagram"}
                ]
            }]
        });

        let appt = normalize_appointment(&record, today()).unwrap();
        assert_eq!(appt.external_id, "9001");
        assert_eq!(appt.date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(appt.phone_e164.as_deref(), Some("+15551234567"));
        assert_eq!(appt.client_key.as_deref(), Some("jane@example.com"));
        assert_eq!(appt.price, 45.0);
        assert_eq!(appt.tip, 5.0);
        assert_eq!(appt.referral_source.as_deref(), Some("Instagram"));
        assert_eq!(appt.extras.location_id.as_deref(), Some("77"));
    }

    #[test]
    fn drops_records_without_identity() {
        let record = json!({
            "id": 9002,
            "datetime": "2024-01-05T10:00:00-0800",
            "firstName": "J",
            "lastName": "",
            "type": "Haircut",
            "price": 40
        });
        assert!(normalize_appointment(&record, today()).is_none());
    }

    #[test]
    fn drops_future_dated_records() {
        let record = json!({
            "id": 9003,
            "datetime": "2024-03-01T10:00:00-0800",
            "email": "jane@example.com",
            "firstName": "Jane",
            "lastName": "Doe"
        });
        assert!(normalize_appointment(&record, today()).is_none());
    }

    #[test]
    fn bad_phone_is_non_fatal_when_email_present() {
        let record = json!({
            "id": 9004,
            "datetime": "2024-01-05T10:00:00-0800",
            "email": "jane@example.com",
            "phone": "12345",
            "firstName": "Jane",
            "lastName": "Doe"
        });
        let appt = normalize_appointment(&record, today()).unwrap();
        assert_eq!(appt.phone_e164, None);
        assert_eq!(appt.phone_raw.as_deref(), Some("12345"));
    }

    #[test]
    fn calendar_matching_is_case_insensitive_and_trimmed() {
        let calendars = vec![
            json!({"id": 1, "name": "Downtown Studio"}),
            json!({"id": 2, "name": "  Uptown Loft "}),
        ];
        assert_eq!(
            find_calendar_id(&calendars, "uptown loft"),
            Some("2".to_string())
        );
        assert_eq!(find_calendar_id(&calendars, "Midtown"), None);
    }

    #[tokio::test]
    async fn missing_credential_is_connection_missing() {
        let store = tally_store::MemoryStore::new();
        let adapter = AcuityAdapter::new(ApiClient::new(Default::default()).unwrap());
        let err = adapter.ensure_valid_token(&store, "t1").await.unwrap_err();
        assert!(matches!(err, AdapterError::ConnectionMissing { .. }));
    }

    #[tokio::test]
    async fn unexpired_credential_is_returned_without_refresh() {
        let store = tally_store::MemoryStore::new();
        store
            .insert_credential(CredentialRow {
                tenant_id: "t1".into(),
                platform: "acuity".into(),
                access_token: "live-token".into(),
                refresh_token: "rt".into(),
                expires_at: Utc::now() + Duration::hours(1),
                updated_at: Utc::now(),
            })
            .await;

        let adapter = AcuityAdapter::new(ApiClient::new(Default::default()).unwrap());
        let token = adapter.ensure_valid_token(&store, "t1").await.unwrap();
        assert_eq!(token, "live-token");
    }
}
