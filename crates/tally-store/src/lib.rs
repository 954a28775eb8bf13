//! Persistence contract for the Tally pipeline.
//!
//! Every write in the pipeline goes through [`Store`], which exposes only
//! filtered selects and upserts with explicit conflict keys. No
//! multi-statement transactional semantics are assumed: each table write is
//! independently idempotent, which is what makes a retried pull converge.

pub mod http;
pub mod postgres;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use tally_core::{
    ClientRankStat, DailyStat, DateRange, FunnelStat, MonthlyStat, NormalizedClient, ServiceStat,
    WeeklyStat,
};

pub const CRATE_NAME: &str = "tally-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Stored OAuth credential for one (tenant, platform) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRow {
    pub tenant_id: String,
    pub platform: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Tenant integration settings read by adapters during resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub platform: String,
    /// Single-calendar platforms: the configured calendar name to match.
    pub calendar_name: Option<String>,
    /// Multi-location platforms: explicitly selected location ids
    /// (empty selection means "all active locations").
    pub location_ids: Vec<String>,
}

/// One persisted appointment, conflict key `(tenant_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRow {
    pub tenant_id: String,
    pub external_id: String,
    pub client_key: Option<String>,
    pub date: NaiveDate,
    pub datetime: Option<NaiveDateTime>,
    pub service_type: String,
    pub revenue: Option<f64>,
    pub tip: Option<f64>,
    pub notes: Option<String>,
    pub referral_source: Option<String>,
    pub cancelled: bool,
    /// Once true, upstream refreshes never touch `revenue`/`tip` again.
    pub manually_edited: bool,
    pub location_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub team_member_id: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

/// One persisted client, conflict key `(tenant_id, client_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRow {
    pub tenant_id: String,
    pub client_key: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub first_appt: Option<NaiveDate>,
    pub second_appt: Option<NaiveDate>,
    pub last_appt: Option<NaiveDate>,
    pub first_source: Option<String>,
    pub total_appointments: i64,
}

impl ClientRow {
    pub fn from_client(tenant_id: &str, client: &NormalizedClient) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_key: client.client_key.clone(),
            email: client.email.clone(),
            phone: client.phone.clone(),
            first_name: client.first_name.clone(),
            last_name: client.last_name.clone(),
            first_appt: client.first_appt,
            second_appt: client.second_appt,
            last_appt: client.last_appt,
            first_source: client.first_source.clone(),
            total_appointments: client.total_appointments,
        }
    }

    pub fn into_client(self) -> NormalizedClient {
        NormalizedClient {
            client_key: self.client_key,
            email: self.email,
            phone: self.phone,
            first_name: self.first_name,
            last_name: self.last_name,
            first_appt: self.first_appt,
            second_appt: self.second_appt,
            last_appt: self.last_appt,
            first_source: self.first_source,
            total_appointments: self.total_appointments,
        }
    }
}

/// Read-rows / upsert-rows-with-conflict-key contract.
///
/// Conflict keys are part of each method's documented contract, not an
/// implementation detail; the Postgres and in-memory stores must agree.
#[async_trait]
pub trait Store: Send + Sync {
    async fn credential(
        &self,
        tenant_id: &str,
        platform: &str,
    ) -> Result<Option<CredentialRow>, StoreError>;

    /// Conflict key `(tenant_id, platform)`.
    async fn save_credential(&self, row: &CredentialRow) -> Result<(), StoreError>;

    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError>;

    async fn clients(&self, tenant_id: &str) -> Result<Vec<ClientRow>, StoreError>;

    /// Conflict key `(tenant_id, client_key)`. Append-only from the
    /// pipeline's point of view; clients are never deleted here.
    async fn upsert_clients(&self, rows: &[ClientRow]) -> Result<u64, StoreError>;

    async fn appointments_in_range(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> Result<Vec<AppointmentRow>, StoreError>;

    async fn appointments_by_external_id(
        &self,
        tenant_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<AppointmentRow>, StoreError>;

    /// Total persisted appointment count per client key, not limited to any
    /// date range.
    async fn appointment_counts(
        &self,
        tenant_id: &str,
        client_keys: &[String],
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Conflict key `(tenant_id, external_id)`. Rows whose stored
    /// `manually_edited` flag is true keep their stored `revenue`/`tip`
    /// regardless of the incoming values.
    async fn upsert_appointments(&self, rows: &[AppointmentRow]) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, date)`.
    async fn upsert_daily_stats(
        &self,
        tenant_id: &str,
        rows: &[DailyStat],
    ) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, week_number, month, year)`.
    async fn upsert_weekly_stats(
        &self,
        tenant_id: &str,
        rows: &[WeeklyStat],
    ) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, month, year)`.
    async fn upsert_monthly_stats(
        &self,
        tenant_id: &str,
        rows: &[MonthlyStat],
    ) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, month, year, client_key)`.
    async fn upsert_client_rank_stats(
        &self,
        tenant_id: &str,
        rows: &[ClientRankStat],
    ) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, service_name, month, year)`.
    async fn upsert_service_stats(
        &self,
        tenant_id: &str,
        rows: &[ServiceStat],
    ) -> Result<u64, StoreError>;

    /// Conflict key `(tenant_id, source, period)`.
    async fn upsert_funnel_stats(
        &self,
        tenant_id: &str,
        rows: &[FunnelStat],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    credentials: BTreeMap<(String, String), CredentialRow>,
    profiles: BTreeMap<String, TenantProfile>,
    clients: BTreeMap<(String, String), ClientRow>,
    appointments: BTreeMap<(String, String), AppointmentRow>,
    daily: BTreeMap<(String, NaiveDate), DailyStat>,
    weekly: BTreeMap<(String, u32, u32, i32), WeeklyStat>,
    monthly: BTreeMap<(String, u32, i32), MonthlyStat>,
    client_rank: BTreeMap<(String, u32, i32, String), ClientRankStat>,
    service: BTreeMap<(String, String, u32, i32), ServiceStat>,
    funnel: BTreeMap<(String, String, String), FunnelStat>,
}

/// In-memory [`Store`] with the same conflict-key semantics as Postgres.
/// Used by unit and integration tests; no network, no disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: TenantProfile) {
        let mut inner = self.inner.lock().await;
        inner.profiles.insert(profile.tenant_id.clone(), profile);
    }

    pub async fn insert_credential(&self, row: CredentialRow) {
        let mut inner = self.inner.lock().await;
        inner
            .credentials
            .insert((row.tenant_id.clone(), row.platform.clone()), row);
    }

    /// Test hook: flip the manual-edit flag and pin financials on one row.
    pub async fn mark_manually_edited(
        &self,
        tenant_id: &str,
        external_id: &str,
        revenue: f64,
        tip: f64,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner
            .appointments
            .get_mut(&(tenant_id.to_string(), external_id.to_string()))
        {
            row.manually_edited = true;
            row.revenue = Some(revenue);
            row.tip = Some(tip);
        }
    }

    pub async fn daily_stats(&self, tenant_id: &str) -> Vec<DailyStat> {
        let inner = self.inner.lock().await;
        inner
            .daily
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn weekly_stats(&self, tenant_id: &str) -> Vec<WeeklyStat> {
        let inner = self.inner.lock().await;
        inner
            .weekly
            .iter()
            .filter(|((t, _, _, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn monthly_stats(&self, tenant_id: &str) -> Vec<MonthlyStat> {
        let inner = self.inner.lock().await;
        inner
            .monthly
            .iter()
            .filter(|((t, _, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn client_rank_stats(&self, tenant_id: &str) -> Vec<ClientRankStat> {
        let inner = self.inner.lock().await;
        inner
            .client_rank
            .iter()
            .filter(|((t, _, _, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn service_stats(&self, tenant_id: &str) -> Vec<ServiceStat> {
        let inner = self.inner.lock().await;
        inner
            .service
            .iter()
            .filter(|((t, _, _, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn funnel_stats(&self, tenant_id: &str) -> Vec<FunnelStat> {
        let inner = self.inner.lock().await;
        inner
            .funnel
            .iter()
            .filter(|((t, _, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn credential(
        &self,
        tenant_id: &str,
        platform: &str,
    ) -> Result<Option<CredentialRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .credentials
            .get(&(tenant_id.to_string(), platform.to_string()))
            .cloned())
    }

    async fn save_credential(&self, row: &CredentialRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .credentials
            .insert((row.tenant_id.clone(), row.platform.clone()), row.clone());
        Ok(())
    }

    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.profiles.get(tenant_id).cloned())
    }

    async fn clients(&self, tenant_id: &str) -> Result<Vec<ClientRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .clients
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn upsert_clients(&self, rows: &[ClientRow]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .clients
                .insert((row.tenant_id.clone(), row.client_key.clone()), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn appointments_in_range(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> Result<Vec<AppointmentRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .appointments
            .iter()
            .filter(|((t, _), row)| t == tenant_id && range.contains(row.date))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn appointments_by_external_id(
        &self,
        tenant_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<AppointmentRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(external_ids
            .iter()
            .filter_map(|id| {
                inner
                    .appointments
                    .get(&(tenant_id.to_string(), id.clone()))
                    .cloned()
            })
            .collect())
    }

    async fn appointment_counts(
        &self,
        tenant_id: &str,
        client_keys: &[String],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for ((t, _), row) in inner.appointments.iter() {
            if t != tenant_id {
                continue;
            }
            let Some(key) = &row.client_key else { continue };
            if client_keys.contains(key) {
                *counts.entry(key.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn upsert_appointments(&self, rows: &[AppointmentRow]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            let key = (row.tenant_id.clone(), row.external_id.clone());
            match inner.appointments.get_mut(&key) {
                Some(existing) if existing.manually_edited => {
                    let kept_revenue = existing.revenue;
                    let kept_tip = existing.tip;
                    let mut updated = row.clone();
                    updated.revenue = kept_revenue;
                    updated.tip = kept_tip;
                    updated.manually_edited = true;
                    *existing = updated;
                }
                _ => {
                    inner.appointments.insert(key, row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_daily_stats(
        &self,
        tenant_id: &str,
        rows: &[DailyStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .daily
                .insert((tenant_id.to_string(), row.date), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_weekly_stats(
        &self,
        tenant_id: &str,
        rows: &[WeeklyStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.weekly.insert(
                (tenant_id.to_string(), row.week_number, row.month, row.year),
                row.clone(),
            );
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_monthly_stats(
        &self,
        tenant_id: &str,
        rows: &[MonthlyStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .monthly
                .insert((tenant_id.to_string(), row.month, row.year), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_client_rank_stats(
        &self,
        tenant_id: &str,
        rows: &[ClientRankStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.client_rank.insert(
                (
                    tenant_id.to_string(),
                    row.month,
                    row.year,
                    row.client_key.clone(),
                ),
                row.clone(),
            );
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_service_stats(
        &self,
        tenant_id: &str,
        rows: &[ServiceStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.service.insert(
                (
                    tenant_id.to_string(),
                    row.service_name.clone(),
                    row.month,
                    row.year,
                ),
                row.clone(),
            );
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_funnel_stats(
        &self,
        tenant_id: &str,
        rows: &[FunnelStat],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.funnel.insert(
                (tenant_id.to_string(), row.source.clone(), row.period.clone()),
                row.clone(),
            );
        }
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn appt(external_id: &str, date: &str, revenue: f64) -> AppointmentRow {
        AppointmentRow {
            tenant_id: "t1".into(),
            external_id: external_id.into(),
            client_key: Some("jane@example.com".into()),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            datetime: None,
            service_type: "Cut".into(),
            revenue: Some(revenue),
            tip: Some(5.0),
            notes: None,
            referral_source: None,
            cancelled: false,
            manually_edited: false,
            location_id: None,
            order_id: None,
            payment_id: None,
            team_member_id: None,
            status: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn appointment_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let rows = vec![appt("a1", "2024-01-05", 40.0)];
        store.upsert_appointments(&rows).await.unwrap();
        store.upsert_appointments(&rows).await.unwrap();

        let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
        let stored = store.appointments_in_range("t1", range).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].revenue, Some(40.0));
    }

    #[tokio::test]
    async fn manually_edited_rows_keep_their_financials() {
        let store = MemoryStore::new();
        store
            .upsert_appointments(&[appt("a1", "2024-01-05", 40.0)])
            .await
            .unwrap();
        store.mark_manually_edited("t1", "a1", 55.0, 10.0).await;

        // Upstream now reports different numbers on re-pull.
        store
            .upsert_appointments(&[appt("a1", "2024-01-05", 40.0)])
            .await
            .unwrap();

        let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
        let stored = store.appointments_in_range("t1", range).await.unwrap();
        assert_eq!(stored[0].revenue, Some(55.0));
        assert_eq!(stored[0].tip, Some(10.0));
        assert!(stored[0].manually_edited);
    }

    #[tokio::test]
    async fn appointment_counts_span_all_history() {
        let store = MemoryStore::new();
        store
            .upsert_appointments(&[
                appt("a1", "2023-06-01", 40.0),
                appt("a2", "2024-01-05", 40.0),
            ])
            .await
            .unwrap();

        let counts = store
            .appointment_counts("t1", &["jane@example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(counts.get("jane@example.com"), Some(&2));
    }

    #[tokio::test]
    async fn credential_roundtrip_by_tenant_and_platform() {
        let store = MemoryStore::new();
        let row = CredentialRow {
            tenant_id: "t1".into(),
            platform: "acuity".into(),
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_credential(row.clone()).await;
        let loaded = store.credential("t1", "acuity").await.unwrap();
        assert_eq!(loaded, Some(row));
        assert_eq!(store.credential("t1", "square").await.unwrap(), None);
    }
}
