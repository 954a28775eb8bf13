//! Appointment reconciliation.
//!
//! Maps each normalized appointment to its resolved client, builds rows keyed
//! `(tenant, external_id)`, and upserts them in one batch. Rows flagged
//! `manually_edited` keep their stored financials; that guard lives in the
//! store so retried pulls cannot race past it.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use tally_core::{ClientResolutionResult, NormalizedAppointment};
use tally_store::{AppointmentRow, Store, StoreError};

/// Per-pull observability counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_no_client: usize,
}

pub struct AppointmentReconciler<'a> {
    store: &'a dyn Store,
    tenant_id: &'a str,
}

impl<'a> AppointmentReconciler<'a> {
    pub fn new(store: &'a dyn Store, tenant_id: &'a str) -> Self {
        Self { store, tenant_id }
    }

    pub async fn reconcile(
        &self,
        appointments: &[NormalizedAppointment],
        resolution: &ClientResolutionResult,
    ) -> Result<ReconcileCounts, StoreError> {
        let mut counts = ReconcileCounts::default();
        let mut rows = Vec::with_capacity(appointments.len());

        for appt in appointments {
            let client_key = resolution.appointment_clients.get(&appt.external_id).cloned();
            // Anonymous point-of-sale records carry revenue but no client;
            // they are kept. Anything else without a client is dropped.
            let financial_only =
                appt.extras.payment_id.is_some() || appt.extras.order_id.is_some();
            if client_key.is_none() && !financial_only {
                counts.skipped_no_client += 1;
                continue;
            }

            counts.processed += 1;
            rows.push(self.row_from(appt, client_key));
        }

        let existing: HashSet<String> = {
            let ids: Vec<String> = rows.iter().map(|r| r.external_id.clone()).collect();
            self.store
                .appointments_by_external_id(self.tenant_id, &ids)
                .await?
                .into_iter()
                .map(|r| r.external_id)
                .collect()
        };
        for row in &rows {
            if existing.contains(&row.external_id) {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        self.store.upsert_appointments(&rows).await?;
        info!(
            tenant_id = self.tenant_id,
            processed = counts.processed,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped_no_client = counts.skipped_no_client,
            "appointments reconciled"
        );
        Ok(counts)
    }

    fn row_from(
        &self,
        appt: &NormalizedAppointment,
        client_key: Option<String>,
    ) -> AppointmentRow {
        AppointmentRow {
            tenant_id: self.tenant_id.to_string(),
            external_id: appt.external_id.clone(),
            client_key,
            date: appt.date,
            datetime: appt.datetime,
            service_type: appt.service_type.clone(),
            revenue: Some(appt.price),
            tip: Some(appt.tip),
            notes: appt.notes.clone(),
            referral_source: appt.referral_source.clone(),
            cancelled: appt.cancelled,
            manually_edited: false,
            location_id: appt.extras.location_id.clone(),
            order_id: appt.extras.order_id.clone(),
            payment_id: appt.extras.payment_id.clone(),
            team_member_id: appt.extras.team_member_id.clone(),
            status: appt.extras.status.clone(),
            created_at: appt.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tally_core::{AppointmentExtras, DateRange};
    use tally_store::MemoryStore;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn appt(external_id: &str, key: Option<&str>, price: f64) -> NormalizedAppointment {
        NormalizedAppointment {
            external_id: external_id.to_string(),
            date: d("2024-01-05"),
            datetime: None,
            email: Some("jane@example.com".into()),
            phone_raw: None,
            phone_e164: None,
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            client_key: key.map(ToString::to_string),
            service_type: "Cut".into(),
            price,
            tip: 5.0,
            created_at: None,
            notes: None,
            referral_source: None,
            cancelled: false,
            extras: AppointmentExtras::default(),
        }
    }

    fn resolution_for(appointments: &[NormalizedAppointment]) -> ClientResolutionResult {
        let mut result = ClientResolutionResult::default();
        for appt in appointments {
            if let Some(key) = &appt.client_key {
                result
                    .appointment_clients
                    .insert(appt.external_id.clone(), key.clone());
            }
        }
        result
    }

    #[tokio::test]
    async fn counts_distinguish_inserted_from_updated() {
        let store = MemoryStore::new();
        let reconciler = AppointmentReconciler::new(&store, "t1");
        let batch = vec![appt("a1", Some("k"), 40.0), appt("a2", Some("k"), 60.0)];
        let resolution = resolution_for(&batch);

        let first = reconciler.reconcile(&batch, &resolution).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.updated, 0);

        let second = reconciler.reconcile(&batch, &resolution).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(second.processed, 2);
    }

    #[tokio::test]
    async fn appointment_without_client_is_counted_and_dropped() {
        let store = MemoryStore::new();
        let reconciler = AppointmentReconciler::new(&store, "t1");
        let batch = vec![appt("a1", None, 40.0)];
        let resolution = resolution_for(&batch);

        let counts = reconciler.reconcile(&batch, &resolution).await.unwrap();
        assert_eq!(counts.skipped_no_client, 1);
        assert_eq!(counts.processed, 0);

        let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
        assert!(store.appointments_in_range("t1", range).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn anonymous_pos_record_is_kept() {
        let store = MemoryStore::new();
        let reconciler = AppointmentReconciler::new(&store, "t1");
        let mut pos = appt("pay-9", None, 25.0);
        pos.extras.payment_id = Some("9".into());
        let resolution = resolution_for(&[pos.clone()]);

        let counts = reconciler.reconcile(&[pos], &resolution).await.unwrap();
        assert_eq!(counts.processed, 1);
        assert_eq!(counts.skipped_no_client, 0);

        let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
        let stored = store.appointments_in_range("t1", range).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].client_key, None);
        assert_eq!(stored[0].revenue, Some(25.0));
    }

    #[tokio::test]
    async fn manually_edited_row_survives_re_reconcile() {
        let store = MemoryStore::new();
        let reconciler = AppointmentReconciler::new(&store, "t1");
        let batch = vec![appt("a1", Some("k"), 40.0)];
        let resolution = resolution_for(&batch);

        reconciler.reconcile(&batch, &resolution).await.unwrap();
        store.mark_manually_edited("t1", "a1", 75.0, 12.0).await;
        reconciler.reconcile(&batch, &resolution).await.unwrap();

        let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
        let stored = store.appointments_in_range("t1", range).await.unwrap();
        assert_eq!(stored[0].revenue, Some(75.0));
        assert_eq!(stored[0].tip, Some(12.0));
        assert!(stored[0].manually_edited);
    }
}
