//! Square-style multi-location adapter.
//!
//! Bookings, payments, and orders are independent paginated resources.
//! Payments and orders are additional financial sources reconciled against
//! booking-derived appointments so revenue is never counted twice: a
//! payment/order already linked to a booking via shared order/payment id
//! fills that booking's financials instead of becoming its own record.

use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use tally_core::{AppointmentExtras, DateRange, NormalizedAppointment};
use tally_store::http::ApiClient;
use tally_store::{CredentialRow, Store};

use crate::{
    dedup_by_external_id, AdapterError, CursorPager, FetchOutcome, PlatformAdapter,
    ResourceSelector,
};

const PLATFORM: &str = "square";
const API_VERSION: &str = "2024-01-18";
const DEFAULT_BASE_URL: &str = "https://connect.squareup.com";
/// Hard platform limit on one booking query window.
const MAX_QUERY_WINDOW_DAYS: i64 = 31;
const CHUNK_PAD_DAYS: i64 = 1;
const PAGE_LIMIT: usize = 100;
/// Politeness delay between paginated requests.
const PAGE_DELAY: StdDuration = StdDuration::from_millis(200);
const DEFAULT_TOKEN_EXPIRY_SECS: i64 = 30 * 24 * 3600;

pub struct SquareAdapter {
    http: ApiClient,
    base_url: String,
}

/// Contact details looked up from the remote customer directory.
#[derive(Debug, Clone, Default)]
pub struct CustomerContact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub given_name: String,
    pub family_name: String,
}

/// A completed (or not) payment, pre-reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub id: String,
    pub order_id: Option<String>,
    pub location_id: Option<String>,
    pub customer_id: Option<String>,
    pub date: NaiveDate,
    pub amount: f64,
    pub tip: f64,
    pub completed: bool,
}

/// An order, pre-reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub id: String,
    pub location_id: Option<String>,
    pub customer_id: Option<String>,
    pub date: NaiveDate,
    pub total: f64,
    pub completed: bool,
}

impl SquareAdapter {
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

    fn headers(&self) -> [(&'static str, &'static str); 1] {
        [("Square-Version", API_VERSION)]
    }

    async fn refresh_token(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        stale: &CredentialRow,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/oauth2/token", self.base_url);
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": stale.refresh_token,
        });
        let response = self
            .http
            .post_json(&url, &body, &self.headers(), None)
            .await
            .map_err(|err| AdapterError::TokenRefreshFailed {
                tenant: tenant_id.to_string(),
                platform: PLATFORM.to_string(),
                reason: err.to_string(),
            })?;

        let access_token = response
            .get("access_token")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AdapterError::TokenRefreshFailed {
                tenant: tenant_id.to_string(),
                platform: PLATFORM.to_string(),
                reason: "response missing access_token".to_string(),
            })?
            .to_string();
        let refresh_token = response
            .get("refresh_token")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| stale.refresh_token.clone());
        let now = Utc::now();
        let expires_at = response
            .get("expires_at")
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TOKEN_EXPIRY_SECS));

        let refreshed = CredentialRow {
            tenant_id: tenant_id.to_string(),
            platform: PLATFORM.to_string(),
            access_token: access_token.clone(),
            refresh_token,
            expires_at,
            updated_at: now,
        };
        store.save_credential(&refreshed).await?;
        Ok(access_token)
    }

    /// Page through the customer directory once per fetch; bookings only
    /// carry customer ids.
    async fn fetch_customers(
        &self,
        token: &str,
        partial: &mut bool,
    ) -> HashMap<String, CustomerContact> {
        let url = format!("{}/v2/customers", self.base_url);
        let mut directory = HashMap::new();
        let mut pager = CursorPager::new();

        loop {
            let mut query = vec![("limit", PAGE_LIMIT.to_string())];
            if let Some(cursor) = pager.cursor() {
                query.push(("cursor", cursor.to_string()));
            }
            let page = match self
                .http
                .get_json(&url, &query, &self.headers(), Some(token))
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "customer page fetch failed; continuing with partial directory");
                    *partial = true;
                    break;
                }
            };

            if let Some(customers) = page.get("customers").and_then(JsonValue::as_array) {
                for customer in customers {
                    let Some(id) = customer.get("id").and_then(JsonValue::as_str) else {
                        continue;
                    };
                    directory.insert(
                        id.to_string(),
                        CustomerContact {
                            email: json_string(customer, "email_address"),
                            phone: json_string(customer, "phone_number"),
                            given_name: json_string(customer, "given_name").unwrap_or_default(),
                            family_name: json_string(customer, "family_name").unwrap_or_default(),
                        },
                    );
                }
            }

            let next = page
                .get("cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            if !pager.advance(next) {
                break;
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }

        directory
    }

    async fn fetch_bookings(
        &self,
        token: &str,
        location_id: &str,
        chunk: DateRange,
        directory: &HashMap<String, CustomerContact>,
        today: NaiveDate,
        partial: &mut bool,
        pages_fetched: &mut usize,
    ) -> Vec<NormalizedAppointment> {
        let url = format!("{}/v2/bookings", self.base_url);
        let mut bookings = Vec::new();
        let mut pager = CursorPager::new();

        loop {
            let mut query = vec![
                ("location_id", location_id.to_string()),
                ("start_at_min", day_start_rfc3339(chunk.start)),
                ("start_at_max", day_start_rfc3339(chunk.end + Duration::days(1))),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(cursor) = pager.cursor() {
                query.push(("cursor", cursor.to_string()));
            }

            let page = match self
                .http
                .get_json(&url, &query, &self.headers(), Some(token))
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(location_id, chunk = %chunk, error = %err, "booking page fetch failed; stopping this chunk early");
                    *partial = true;
                    break;
                }
            };
            *pages_fetched += 1;

            if let Some(records) = page.get("bookings").and_then(JsonValue::as_array) {
                bookings.extend(
                    records
                        .iter()
                        .filter_map(|record| normalize_booking(record, directory, today)),
                );
            }

            let next = page
                .get("cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            if !pager.advance(next) {
                break;
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }

        bookings
    }

    async fn fetch_payments(
        &self,
        token: &str,
        location_id: &str,
        chunk: DateRange,
        partial: &mut bool,
        pages_fetched: &mut usize,
    ) -> Vec<PaymentRecord> {
        let url = format!("{}/v2/payments", self.base_url);
        let mut payments = Vec::new();
        let mut pager = CursorPager::new();

        loop {
            let mut query = vec![
                ("location_id", location_id.to_string()),
                ("begin_time", day_start_rfc3339(chunk.start)),
                ("end_time", day_start_rfc3339(chunk.end + Duration::days(1))),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(cursor) = pager.cursor() {
                query.push(("cursor", cursor.to_string()));
            }

            let page = match self
                .http
                .get_json(&url, &query, &self.headers(), Some(token))
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(location_id, chunk = %chunk, error = %err, "payment page fetch failed; stopping this chunk early");
                    *partial = true;
                    break;
                }
            };
            *pages_fetched += 1;

            if let Some(records) = page.get("payments").and_then(JsonValue::as_array) {
                payments.extend(records.iter().filter_map(normalize_payment));
            }

            let next = page
                .get("cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            if !pager.advance(next) {
                break;
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }

        payments
    }

    async fn fetch_orders(
        &self,
        token: &str,
        location_ids: &[String],
        chunk: DateRange,
        partial: &mut bool,
        pages_fetched: &mut usize,
    ) -> Vec<OrderRecord> {
        let url = format!("{}/v2/orders/search", self.base_url);
        let mut orders = Vec::new();
        let mut pager = CursorPager::new();

        loop {
            let mut body = json!({
                "location_ids": location_ids,
                "limit": PAGE_LIMIT,
                "query": {
                    "filter": {
                        "date_time_filter": {
                            "created_at": {
                                "start_at": day_start_rfc3339(chunk.start),
                                "end_at": day_start_rfc3339(chunk.end + Duration::days(1)),
                            }
                        }
                    }
                }
            });
            if let Some(cursor) = pager.cursor() {
                body["cursor"] = json!(cursor);
            }

            let page = match self
                .http
                .post_json(&url, &body, &self.headers(), Some(token))
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(chunk = %chunk, error = %err, "order page fetch failed; stopping this chunk early");
                    *partial = true;
                    break;
                }
            };
            *pages_fetched += 1;

            if let Some(records) = page.get("orders").and_then(JsonValue::as_array) {
                orders.extend(records.iter().filter_map(normalize_order));
            }

            let next = page
                .get("cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            if !pager.advance(next) {
                break;
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }

        orders
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for SquareAdapter {
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

        // Timestamp-based refresh: compare stored expiry to now rather than
        // retrying on a 401.
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
        let selected = store
            .tenant_profile(tenant_id)
            .await?
            .map(|p| p.location_ids)
            .unwrap_or_default();

        let url = format!("{}/v2/locations", self.base_url);
        let response = self
            .http
            .get_json(&url, &[], &self.headers(), Some(token))
            .await?;
        let locations = response
            .get("locations")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Malformed {
                platform: PLATFORM.to_string(),
                detail: "location listing missing locations array".to_string(),
            })?;

        let active: Vec<String> = locations
            .iter()
            .filter(|loc| {
                loc.get("status").and_then(JsonValue::as_str) == Some("ACTIVE")
            })
            .filter_map(|loc| loc.get("id").and_then(JsonValue::as_str))
            .map(ToString::to_string)
            .collect();

        // Empty selection means "all locations"; otherwise keep only the
        // selected ids that are still active.
        let ids = if selected.is_empty() {
            active
        } else {
            active
                .into_iter()
                .filter(|id| selected.contains(id))
                .collect()
        };

        Ok(ResourceSelector::Locations { ids })
    }

    async fn fetch_appointments(
        &self,
        token: &str,
        selector: &ResourceSelector,
        range: DateRange,
    ) -> Result<FetchOutcome, AdapterError> {
        let ResourceSelector::Locations { ids } = selector else {
            return Err(AdapterError::Malformed {
                platform: PLATFORM.to_string(),
                detail: "expected a locations selector".to_string(),
            });
        };

        let today = Utc::now().date_naive();
        let mut partial = false;
        let mut pages_fetched = 0usize;
        let directory = self.fetch_customers(token, &mut partial).await;

        let mut bookings = Vec::new();
        let mut payments = Vec::new();
        let mut orders = Vec::new();

        for chunk in range.chunks(MAX_QUERY_WINDOW_DAYS, CHUNK_PAD_DAYS) {
            for location_id in ids {
                bookings.extend(
                    self.fetch_bookings(
                        token,
                        location_id,
                        chunk,
                        &directory,
                        today,
                        &mut partial,
                        &mut pages_fetched,
                    )
                    .await,
                );
                payments.extend(
                    self.fetch_payments(token, location_id, chunk, &mut partial, &mut pages_fetched)
                        .await,
                );
            }
            orders.extend(
                self.fetch_orders(token, ids, chunk, &mut partial, &mut pages_fetched)
                    .await,
            );
        }

        let merged = merge_financial_records(bookings, payments, orders, &directory);
        let filtered = merged
            .into_iter()
            .filter(|appt| {
                range.contains(appt.date)
                    && appt.date <= today
                    && appt
                        .extras
                        .location_id
                        .as_ref()
                        .map(|loc| ids.contains(loc))
                        .unwrap_or(true)
            })
            .collect();

        Ok(FetchOutcome {
            appointments: dedup_by_external_id(filtered),
            pages_fetched,
            partial,
        })
    }
}

/// Fold payments and orders into the booking-derived appointments.
///
/// A payment linked to a booking (shared order/payment id) fills that
/// booking's financials; an unlinked completed payment becomes a
/// point-of-sale record; an order is emitted only when no booking and no
/// payment already accounts for it.
pub fn merge_financial_records(
    mut bookings: Vec<NormalizedAppointment>,
    payments: Vec<PaymentRecord>,
    orders: Vec<OrderRecord>,
    directory: &HashMap<String, CustomerContact>,
) -> Vec<NormalizedAppointment> {
    let mut by_order: HashMap<String, usize> = HashMap::new();
    let mut by_payment: HashMap<String, usize> = HashMap::new();
    for (idx, booking) in bookings.iter().enumerate() {
        if let Some(order_id) = &booking.extras.order_id {
            by_order.insert(order_id.clone(), idx);
        }
        if let Some(payment_id) = &booking.extras.payment_id {
            by_payment.insert(payment_id.clone(), idx);
        }
    }

    let mut covered_orders: HashSet<String> = by_order.keys().cloned().collect();
    let mut extra: Vec<NormalizedAppointment> = Vec::new();

    for payment in payments {
        if !payment.completed {
            continue;
        }
        if let Some(order_id) = &payment.order_id {
            covered_orders.insert(order_id.clone());
        }

        let linked = payment
            .order_id
            .as_ref()
            .and_then(|oid| by_order.get(oid))
            .or_else(|| by_payment.get(&payment.id))
            .copied();

        match linked {
            Some(idx) => {
                // Already represented by a booking; fill financials instead
                // of emitting a second revenue record.
                let booking = &mut bookings[idx];
                if booking.price == 0.0 {
                    booking.price = payment.amount;
                }
                if booking.tip == 0.0 {
                    booking.tip = payment.tip;
                }
            }
            None => extra.push(pos_record_from_payment(&payment, directory)),
        }
    }

    for order in orders {
        if !order.completed || covered_orders.contains(&order.id) {
            continue;
        }
        extra.push(pos_record_from_order(&order, directory));
    }

    bookings.extend(extra);
    bookings
}

fn contact_for<'a>(
    customer_id: Option<&str>,
    directory: &'a HashMap<String, CustomerContact>,
) -> Option<&'a CustomerContact> {
    customer_id.and_then(|id| directory.get(id))
}

fn pos_record_from_payment(
    payment: &PaymentRecord,
    directory: &HashMap<String, CustomerContact>,
) -> NormalizedAppointment {
    let contact = contact_for(payment.customer_id.as_deref(), directory);
    NormalizedAppointment {
        external_id: format!("pay-{}", payment.id),
        date: payment.date,
        datetime: None,
        email: contact.and_then(|c| c.email.clone()),
        phone_raw: contact.and_then(|c| c.phone.clone()),
        phone_e164: contact
            .and_then(|c| c.phone.as_deref())
            .and_then(tally_core::normalize_phone),
        first_name: contact.map(|c| c.given_name.clone()).unwrap_or_default(),
        last_name: contact.map(|c| c.family_name.clone()).unwrap_or_default(),
        client_key: payment.customer_id.clone(),
        service_type: "Point of Sale".to_string(),
        price: payment.amount,
        tip: payment.tip,
        created_at: None,
        notes: None,
        referral_source: None,
        cancelled: false,
        extras: AppointmentExtras {
            location_id: payment.location_id.clone(),
            order_id: payment.order_id.clone(),
            payment_id: Some(payment.id.clone()),
            team_member_id: None,
            status: Some("COMPLETED".to_string()),
        },
    }
}

fn pos_record_from_order(
    order: &OrderRecord,
    directory: &HashMap<String, CustomerContact>,
) -> NormalizedAppointment {
    let contact = contact_for(order.customer_id.as_deref(), directory);
    NormalizedAppointment {
        external_id: format!("ord-{}", order.id),
        date: order.date,
        datetime: None,
        email: contact.and_then(|c| c.email.clone()),
        phone_raw: contact.and_then(|c| c.phone.clone()),
        phone_e164: contact
            .and_then(|c| c.phone.as_deref())
            .and_then(tally_core::normalize_phone),
        first_name: contact.map(|c| c.given_name.clone()).unwrap_or_default(),
        last_name: contact.map(|c| c.family_name.clone()).unwrap_or_default(),
        client_key: order.customer_id.clone(),
        service_type: "Point of Sale".to_string(),
        price: order.total,
        tip: 0.0,
        created_at: None,
        notes: None,
        referral_source: None,
        cancelled: false,
        extras: AppointmentExtras {
            location_id: order.location_id.clone(),
            order_id: Some(order.id.clone()),
            payment_id: None,
            team_member_id: None,
            status: Some("COMPLETED".to_string()),
        },
    }
}

/// Normalize one raw booking. Customer contact comes from the directory;
/// records with no resolvable identity are dropped.
pub fn normalize_booking(
    record: &JsonValue,
    directory: &HashMap<String, CustomerContact>,
    today: NaiveDate,
) -> Option<NormalizedAppointment> {
    let external_id = record.get("id").and_then(JsonValue::as_str)?.to_string();
    let start_at = record
        .get("start_at")
        .and_then(JsonValue::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?;
    let date = start_at.date_naive();
    if date > today {
        return None;
    }

    let customer_id = json_string(record, "customer_id");
    let contact = contact_for(customer_id.as_deref(), directory);
    let email = contact.and_then(|c| c.email.clone());
    let phone_raw = contact.and_then(|c| c.phone.clone());
    let phone_e164 = phone_raw.as_deref().and_then(tally_core::normalize_phone);
    let first_name = contact.map(|c| c.given_name.clone()).unwrap_or_default();
    let last_name = contact.map(|c| c.family_name.clone()).unwrap_or_default();

    let segment = record
        .get("appointment_segments")
        .and_then(JsonValue::as_array)
        .and_then(|segments| segments.first());
    let status = json_string(record, "status");
    let cancelled = matches!(
        status.as_deref(),
        Some("CANCELLED_BY_CUSTOMER") | Some("CANCELLED_BY_SELLER") | Some("DECLINED")
    );

    let appointment = NormalizedAppointment {
        external_id,
        date,
        datetime: Some(start_at.naive_local()),
        email,
        phone_raw,
        phone_e164,
        first_name,
        last_name,
        client_key: customer_id,
        service_type: segment
            .and_then(|s| json_string(s, "service_name"))
            .unwrap_or_else(|| "Appointment".to_string()),
        price: json_money(record, "price_money").unwrap_or(0.0),
        tip: 0.0,
        created_at: record
            .get("created_at")
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.naive_utc()),
        notes: json_string(record, "customer_note"),
        referral_source: json_string(record, "source"),
        cancelled,
        extras: AppointmentExtras {
            location_id: json_string(record, "location_id"),
            order_id: json_string(record, "order_id"),
            payment_id: json_string(record, "payment_id"),
            team_member_id: segment.and_then(|s| json_string(s, "team_member_id")),
            status,
        },
    };

    if appointment.has_identity() {
        Some(appointment)
    } else {
        None
    }
}

pub fn normalize_payment(record: &JsonValue) -> Option<PaymentRecord> {
    let id = record.get("id").and_then(JsonValue::as_str)?.to_string();
    let date = record
        .get("created_at")
        .and_then(JsonValue::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
        .date_naive();
    Some(PaymentRecord {
        id,
        order_id: json_string(record, "order_id"),
        location_id: json_string(record, "location_id"),
        customer_id: json_string(record, "customer_id"),
        date,
        amount: json_money(record, "amount_money").unwrap_or(0.0),
        tip: json_money(record, "tip_money").unwrap_or(0.0),
        completed: record.get("status").and_then(JsonValue::as_str) == Some("COMPLETED"),
    })
}

pub fn normalize_order(record: &JsonValue) -> Option<OrderRecord> {
    let id = record.get("id").and_then(JsonValue::as_str)?.to_string();
    let date = record
        .get("created_at")
        .and_then(JsonValue::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
        .date_naive();
    Some(OrderRecord {
        id,
        location_id: json_string(record, "location_id"),
        customer_id: json_string(record, "customer_id"),
        date,
        total: json_money(record, "total_money").unwrap_or(0.0),
        completed: record.get("state").and_then(JsonValue::as_str) == Some("COMPLETED"),
    })
}

fn json_string(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Money objects are `{ "amount": <cents>, "currency": ... }`.
fn json_money(value: &JsonValue, key: &str) -> Option<f64> {
    let cents = value.get(key)?.get("amount")?.as_i64()?;
    Some(cents as f64 / 100.0)
}

fn day_start_rfc3339(date: NaiveDate) -> String {
    format!("{date}T00:00:00Z")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    fn directory() -> HashMap<String, CustomerContact> {
        let mut map = HashMap::new();
        map.insert(
            "cust-1".to_string(),
            CustomerContact {
                email: Some("jane@example.com".into()),
                phone: Some("(555) 123-4567".into()),
                given_name: "Jane".into(),
                family_name: "Doe".into(),
            },
        );
        map
    }

    fn booking_json(id: &str, order_id: Option<&str>) -> JsonValue {
        let mut record = json!({
            "id": id,
            "start_at": "2024-01-05T18:00:00Z",
            "location_id": "loc-1",
            "customer_id": "cust-1",
            "status": "ACCEPTED",
            "appointment_segments": [{"team_member_id": "tm-1", "service_name": "Haircut"}]
        });
        if let Some(order_id) = order_id {
            record["order_id"] = json!(order_id);
        }
        record
    }

    #[test]
    fn booking_normalizes_with_directory_contact() {
        let appt = normalize_booking(&booking_json("b1", None), &directory(), today()).unwrap();
        assert_eq!(appt.external_id, "b1");
        assert_eq!(appt.client_key.as_deref(), Some("cust-1"));
        assert_eq!(appt.email.as_deref(), Some("jane@example.com"));
        assert_eq!(appt.phone_e164.as_deref(), Some("+15551234567"));
        assert_eq!(appt.service_type, "Haircut");
        assert_eq!(appt.extras.team_member_id.as_deref(), Some("tm-1"));
        assert!(!appt.cancelled);
    }

    #[test]
    fn booking_without_known_customer_is_dropped() {
        let record = json!({
            "id": "b2",
            "start_at": "2024-01-05T18:00:00Z",
            "customer_id": "cust-unknown"
        });
        assert!(normalize_booking(&record, &directory(), today()).is_none());
    }

    #[test]
    fn cancelled_statuses_are_flagged() {
        let mut record = booking_json("b3", None);
        record["status"] = json!("CANCELLED_BY_CUSTOMER");
        let appt = normalize_booking(&record, &directory(), today()).unwrap();
        assert!(appt.cancelled);
    }

    #[test]
    fn linked_payment_fills_booking_instead_of_duplicating() {
        let booking =
            normalize_booking(&booking_json("b1", Some("ord-77")), &directory(), today()).unwrap();
        let payment = PaymentRecord {
            id: "pay-1".into(),
            order_id: Some("ord-77".into()),
            location_id: Some("loc-1".into()),
            customer_id: Some("cust-1".into()),
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            amount: 45.0,
            tip: 5.0,
            completed: true,
        };

        let merged = merge_financial_records(vec![booking], vec![payment], vec![], &directory());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "b1");
        assert_eq!(merged[0].price, 45.0);
        assert_eq!(merged[0].tip, 5.0);
    }

    #[test]
    fn unlinked_completed_payment_becomes_pos_record() {
        let payment = PaymentRecord {
            id: "pay-2".into(),
            order_id: Some("ord-88".into()),
            location_id: Some("loc-1".into()),
            customer_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
            amount: 20.0,
            tip: 0.0,
            completed: true,
        };

        let merged = merge_financial_records(vec![], vec![payment], vec![], &directory());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "pay-pay-2");
        assert_eq!(merged[0].service_type, "Point of Sale");
        assert_eq!(merged[0].price, 20.0);
    }

    #[test]
    fn incomplete_payment_is_ignored() {
        let payment = PaymentRecord {
            id: "pay-3".into(),
            order_id: None,
            location_id: None,
            customer_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
            amount: 20.0,
            tip: 0.0,
            completed: false,
        };
        let merged = merge_financial_records(vec![], vec![payment], vec![], &directory());
        assert!(merged.is_empty());
    }

    #[test]
    fn order_covered_by_payment_is_not_double_counted() {
        let payment = PaymentRecord {
            id: "pay-4".into(),
            order_id: Some("ord-99".into()),
            location_id: Some("loc-1".into()),
            customer_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
            amount: 30.0,
            tip: 0.0,
            completed: true,
        };
        let order = OrderRecord {
            id: "ord-99".into(),
            location_id: Some("loc-1".into()),
            customer_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
            total: 30.0,
            completed: true,
        };

        let merged = merge_financial_records(vec![], vec![payment], vec![order], &directory());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "pay-pay-4");
    }

    #[test]
    fn order_linked_to_booking_is_not_double_counted() {
        let booking =
            normalize_booking(&booking_json("b1", Some("ord-77")), &directory(), today()).unwrap();
        let order = OrderRecord {
            id: "ord-77".into(),
            location_id: Some("loc-1".into()),
            customer_id: Some("cust-1".into()),
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            total: 45.0,
            completed: true,
        };

        let merged = merge_financial_records(vec![booking], vec![], vec![order], &directory());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "b1");
    }

    #[test]
    fn standalone_completed_order_becomes_pos_record() {
        let order = OrderRecord {
            id: "ord-55".into(),
            location_id: Some("loc-1".into()),
            customer_id: Some("cust-1".into()),
            date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            total: 60.0,
            completed: true,
        };
        let merged = merge_financial_records(vec![], vec![], vec![order], &directory());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "ord-ord-55");
        assert_eq!(merged[0].price, 60.0);
        assert_eq!(merged[0].client_key.as_deref(), Some("cust-1"));
    }

    #[test]
    fn payment_money_parses_from_cents() {
        let record = json!({
            "id": "pay-9",
            "created_at": "2024-01-05T12:00:00Z",
            "status": "COMPLETED",
            "order_id": "ord-9",
            "location_id": "loc-1",
            "amount_money": {"amount": 4550, "currency": "USD"},
            "tip_money": {"amount": 500, "currency": "USD"}
        });
        let payment = normalize_payment(&record).unwrap();
        assert_eq!(payment.amount, 45.5);
        assert_eq!(payment.tip, 5.0);
        assert!(payment.completed);
    }
}
