//! Client-identity resolution.
//!
//! Collapses a batch of normalized appointments plus the tenant's persisted
//! clients into one merged client map. The merge rules are named and ordered:
//! dates fold through a sorted set (order-independent), contact fields follow
//! "last write among newest wins", names only ever improve, and the first
//! source sticks to the earliest appointment.

use std::collections::BTreeSet;

use tracing::debug;

use tally_core::{
    is_valid_name, ClientResolutionResult, NormalizedAppointment, NormalizedClient,
};
use tally_store::{ClientRow, Store, StoreError};

/// Short-lived resolver constructed per pull; holds no state across runs.
pub struct ClientResolver<'a> {
    store: &'a dyn Store,
    tenant_id: &'a str,
}

impl<'a> ClientResolver<'a> {
    pub fn new(store: &'a dyn Store, tenant_id: &'a str) -> Self {
        Self { store, tenant_id }
    }

    /// Fold the batch into the persisted client map. Append-only: clients are
    /// created or merged, never deleted. Appointments without a client key
    /// are left out of the mapping; the reconciler decides their fate.
    pub async fn resolve(
        &self,
        appointments: &[NormalizedAppointment],
    ) -> Result<ClientResolutionResult, StoreError> {
        let mut result = ClientResolutionResult::default();
        for row in self.store.clients(self.tenant_id).await? {
            result
                .clients
                .insert(row.client_key.clone(), row.into_client());
        }

        for appt in appointments {
            let Some(key) = appt.client_key.clone() else {
                continue;
            };
            result
                .appointment_clients
                .insert(appt.external_id.clone(), key.clone());

            match result.clients.get_mut(&key) {
                Some(existing) => merge_into(existing, appt),
                None => {
                    result.clients.insert(key.clone(), seed_client(&key, appt));
                    result.created_keys.insert(key);
                }
            }
        }

        debug!(
            tenant_id = self.tenant_id,
            clients = result.clients.len(),
            created = result.created_keys.len(),
            "client resolution complete"
        );
        Ok(result)
    }

    /// Recount `total_appointments` for the clients this batch touched, from
    /// persisted appointment rows rather than the batch alone. Runs after the
    /// appointment upsert so the count covers all history including this pull.
    pub async fn recount_totals(
        &self,
        result: &mut ClientResolutionResult,
        appointments: &[NormalizedAppointment],
    ) -> Result<(), StoreError> {
        let affected: BTreeSet<String> = appointments
            .iter()
            .filter_map(|a| a.client_key.clone())
            .collect();
        if affected.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = affected.iter().cloned().collect();
        let counts = self.store.appointment_counts(self.tenant_id, &keys).await?;
        for key in &affected {
            if let Some(client) = result.clients.get_mut(key) {
                client.total_appointments = counts.get(key).copied().unwrap_or(0);
            }
        }
        Ok(())
    }

    /// Rows for the touched clients only, ready for `upsert_clients`.
    pub fn rows_to_upsert(
        &self,
        result: &ClientResolutionResult,
        appointments: &[NormalizedAppointment],
    ) -> Vec<ClientRow> {
        let affected: BTreeSet<&String> = appointments
            .iter()
            .filter_map(|a| a.client_key.as_ref())
            .collect();
        result
            .clients
            .iter()
            .filter(|(key, _)| affected.contains(key))
            .map(|(_, client)| ClientRow::from_client(self.tenant_id, client))
            .collect()
    }
}

fn seed_client(key: &str, appt: &NormalizedAppointment) -> NormalizedClient {
    let mut client = NormalizedClient {
        client_key: key.to_string(),
        email: appt.email.clone(),
        phone: appt.phone_e164.clone().or_else(|| appt.phone_raw.clone()),
        first_name: appt.first_name.clone(),
        last_name: appt.last_name.clone(),
        first_appt: None,
        second_appt: None,
        last_appt: None,
        first_source: appt
            .referral_source
            .clone()
            .filter(|s| !s.trim().is_empty()),
        total_appointments: 0,
    };
    client.fold_date(appt.date);
    client
}

/// The named merge rules, applied in order.
fn merge_into(client: &mut NormalizedClient, appt: &NormalizedAppointment) {
    let prior_first = client.first_appt;
    let is_newest = client.last_appt.map_or(true, |last| appt.date >= last);

    // (a) date tracking: extremal elements of the union of known dates.
    client.fold_date(appt.date);

    // (b) contact fields: last write among newest wins; a known value is
    // never cleared, and an empty slot is always fillable.
    if let Some(email) = &appt.email {
        if is_newest || client.email.is_none() {
            client.email = Some(email.clone());
        }
    }
    let incoming_phone = appt.phone_e164.clone().or_else(|| appt.phone_raw.clone());
    if let Some(phone) = incoming_phone {
        if is_newest || client.phone.is_none() {
            client.phone = Some(phone);
        }
    }

    // (c) names: same recency rule, but a valid name is never replaced by an
    // invalid one.
    let incoming_valid = is_valid_name(&appt.first_name, &appt.last_name);
    let existing_valid = is_valid_name(&client.first_name, &client.last_name);
    if is_newest && (incoming_valid || !existing_valid) {
        client.first_name = appt.first_name.clone();
        client.last_name = appt.last_name.clone();
    }

    // (d) first source: earliest appointment wins.
    if let Some(source) = appt.referral_source.as_ref().filter(|s| !s.trim().is_empty()) {
        if prior_first.map_or(true, |first| appt.date <= first) {
            client.first_source = Some(source.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tally_core::AppointmentExtras;
    use tally_store::MemoryStore;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn appt(external_id: &str, key: &str, date: &str) -> NormalizedAppointment {
        NormalizedAppointment {
            external_id: external_id.to_string(),
            date: d(date),
            datetime: None,
            email: None,
            phone_raw: Some("(555) 123-4567".into()),
            phone_e164: Some("+15551234567".into()),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            client_key: Some(key.to_string()),
            service_type: "Cut".into(),
            price: 40.0,
            tip: 5.0,
            created_at: None,
            notes: None,
            referral_source: Some("Instagram".into()),
            cancelled: false,
            extras: AppointmentExtras::default(),
        }
    }

    #[tokio::test]
    async fn two_appointments_on_one_phone_resolve_to_one_client() {
        let store = MemoryStore::new();
        let resolver = ClientResolver::new(&store, "t1");
        let batch = vec![
            appt("a1", "+15551234567", "2024-01-05"),
            appt("a2", "+15551234567", "2024-01-20"),
        ];

        let result = resolver.resolve(&batch).await.unwrap();
        assert_eq!(result.clients.len(), 1);
        assert_eq!(result.created_keys.len(), 1);
        let client = &result.clients["+15551234567"];
        assert_eq!(client.first_appt, Some(d("2024-01-05")));
        assert_eq!(client.last_appt, Some(d("2024-01-20")));
        assert_eq!(result.appointment_clients["a1"], "+15551234567");
        assert_eq!(result.appointment_clients["a2"], "+15551234567");
    }

    #[tokio::test]
    async fn merge_is_order_independent_for_dates() {
        let store = MemoryStore::new();
        let resolver = ClientResolver::new(&store, "t1");
        let forward = vec![appt("a1", "k", "2024-01-05"), appt("a2", "k", "2024-01-20")];
        let backward = vec![appt("a2", "k", "2024-01-20"), appt("a1", "k", "2024-01-05")];

        let r1 = resolver.resolve(&forward).await.unwrap();
        let r2 = resolver.resolve(&backward).await.unwrap();
        let c1 = &r1.clients["k"];
        let c2 = &r2.clients["k"];
        assert_eq!(c1.first_appt, c2.first_appt);
        assert_eq!(c1.second_appt, c2.second_appt);
        assert_eq!(c1.last_appt, c2.last_appt);
    }

    #[tokio::test]
    async fn valid_name_is_never_replaced_by_invalid() {
        let store = MemoryStore::new();
        let resolver = ClientResolver::new(&store, "t1");
        let mut later = appt("a2", "k", "2024-02-01");
        later.first_name = "J".into();
        later.last_name = "".into();

        let result = resolver
            .resolve(&[appt("a1", "k", "2024-01-05"), later])
            .await
            .unwrap();
        let client = &result.clients["k"];
        assert_eq!(client.first_name, "Jane");
        assert_eq!(client.last_name, "Doe");
    }

    #[tokio::test]
    async fn newest_appointment_wins_contact_fields() {
        let store = MemoryStore::new();
        let resolver = ClientResolver::new(&store, "t1");
        let mut newest = appt("a2", "k", "2024-02-01");
        newest.email = Some("new@example.com".into());
        let mut older = appt("a3", "k", "2024-01-10");
        older.email = Some("old@example.com".into());

        let result = resolver
            .resolve(&[appt("a1", "k", "2024-01-05"), newest, older])
            .await
            .unwrap();
        assert_eq!(
            result.clients["k"].email.as_deref(),
            Some("new@example.com")
        );
    }

    #[tokio::test]
    async fn first_source_sticks_to_earliest_appointment() {
        let store = MemoryStore::new();
        let resolver = ClientResolver::new(&store, "t1");
        let mut earliest = appt("a0", "k", "2024-01-01");
        earliest.referral_source = Some("Google".into());
        let mut later = appt("a1", "k", "2024-03-01");
        later.referral_source = Some("Walk-in".into());

        let result = resolver.resolve(&[later, earliest]).await.unwrap();
        assert_eq!(result.clients["k"].first_source.as_deref(), Some("Google"));
    }

    #[tokio::test]
    async fn recount_totals_reads_persisted_history() {
        use tally_store::AppointmentRow;

        let store = MemoryStore::new();
        // One row from a previous pull, one from this batch.
        let mk_row = |ext: &str, date: &str| AppointmentRow {
            tenant_id: "t1".into(),
            external_id: ext.into(),
            client_key: Some("k".into()),
            date: d(date),
            datetime: None,
            service_type: "Cut".into(),
            revenue: Some(40.0),
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
        };
        store
            .upsert_appointments(&[mk_row("old", "2023-06-01"), mk_row("a1", "2024-01-05")])
            .await
            .unwrap();

        let resolver = ClientResolver::new(&store, "t1");
        let batch = vec![appt("a1", "k", "2024-01-05")];
        let mut result = resolver.resolve(&batch).await.unwrap();
        resolver.recount_totals(&mut result, &batch).await.unwrap();
        assert_eq!(result.clients["k"].total_appointments, 2);
    }
}
