//! Multi-granularity aggregation engine.
//!
//! Every aggregator re-derives its table entirely from persisted appointment
//! and client rows for the requested range, then overwrites via the table's
//! natural conflict key. Row computation is pure and synchronous; only the
//! batched upserts suspend. The daily, weekly, and monthly groups run
//! concurrently over one read-only snapshot, and a failure in one table never
//! stops the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;

use chrono::Datelike;
use serde::Serialize;
use tracing::warn;

use tally_core::{
    is_acquisition_source, month_period, week_end, week_number_in_month, week_start,
    ClientRankStat, DailyStat, DateRange, FunnelStat, Granularity, MonthlyStat, ServiceStat,
    WeeklyStat,
};
use tally_store::{AppointmentRow, ClientRow, Store, StoreError};

/// Per-table result; `error` is set when that aggregator failed and the
/// siblings still ran.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationOutcome {
    pub table: &'static str,
    pub rows_written: u64,
    pub error: Option<String>,
}

/// Read-only source data shared by every aggregator in one run.
pub struct AggregationSnapshot {
    pub appointments: Vec<AppointmentRow>,
    pub clients: HashMap<String, ClientRow>,
}

impl AggregationSnapshot {
    pub async fn load(
        store: &dyn Store,
        tenant_id: &str,
        range: DateRange,
    ) -> Result<Self, StoreError> {
        let appointments = store.appointments_in_range(tenant_id, range).await?;
        let clients = store
            .clients(tenant_id)
            .await?
            .into_iter()
            .map(|row| (row.client_key.clone(), row))
            .collect();
        Ok(Self {
            appointments,
            clients,
        })
    }

    /// Cancelled rows carry no revenue or visit weight.
    fn active(&self) -> impl Iterator<Item = &AppointmentRow> {
        self.appointments.iter().filter(|a| !a.cancelled)
    }
}

fn revenue_of(row: &AppointmentRow) -> f64 {
    row.revenue.unwrap_or(0.0)
}

fn tip_of(row: &AppointmentRow) -> f64 {
    row.tip.unwrap_or(0.0)
}

pub fn daily_rows(snapshot: &AggregationSnapshot) -> Vec<DailyStat> {
    let mut buckets: BTreeMap<chrono::NaiveDate, DailyStat> = BTreeMap::new();
    for row in snapshot.active() {
        let stat = buckets.entry(row.date).or_insert_with(|| DailyStat {
            date: row.date,
            appointments: 0,
            revenue: 0.0,
            tips: 0.0,
        });
        stat.appointments += 1;
        stat.revenue += revenue_of(row);
        stat.tips += tip_of(row);
    }
    buckets.into_values().collect()
}

pub fn weekly_rows(snapshot: &AggregationSnapshot) -> Vec<WeeklyStat> {
    struct WeekBucket {
        appointments: i64,
        revenue: f64,
        client_keys: BTreeSet<String>,
    }

    let mut buckets: BTreeMap<chrono::NaiveDate, WeekBucket> = BTreeMap::new();
    for row in snapshot.active() {
        let bucket = buckets
            .entry(week_start(row.date))
            .or_insert_with(|| WeekBucket {
                appointments: 0,
                revenue: 0.0,
                client_keys: BTreeSet::new(),
            });
        bucket.appointments += 1;
        bucket.revenue += revenue_of(row) + tip_of(row);
        if let Some(key) = &row.client_key {
            bucket.client_keys.insert(key.clone());
        }
    }

    buckets
        .into_iter()
        .map(|(start, bucket)| {
            let end = week_end(start);
            let (new_clients, returning_clients) =
                classify_clients(&snapshot.clients, &bucket.client_keys, |first| {
                    first >= start && first <= end
                });
            WeeklyStat {
                week_start: start,
                week_end: end,
                week_number: week_number_in_month(start),
                month: start.month(),
                year: start.year(),
                appointments: bucket.appointments,
                revenue: bucket.revenue,
                new_clients,
                returning_clients,
            }
        })
        .collect()
}

pub fn monthly_rows(snapshot: &AggregationSnapshot) -> Vec<MonthlyStat> {
    struct MonthBucket {
        appointments: i64,
        revenue: f64,
        client_keys: BTreeSet<String>,
    }

    let mut buckets: BTreeMap<(i32, u32), MonthBucket> = BTreeMap::new();
    for row in snapshot.active() {
        let bucket = buckets
            .entry((row.date.year(), row.date.month()))
            .or_insert_with(|| MonthBucket {
                appointments: 0,
                revenue: 0.0,
                client_keys: BTreeSet::new(),
            });
        bucket.appointments += 1;
        bucket.revenue += revenue_of(row) + tip_of(row);
        if let Some(key) = &row.client_key {
            bucket.client_keys.insert(key.clone());
        }
    }

    buckets
        .into_iter()
        .map(|((year, month), bucket)| {
            let (new_clients, returning_clients) =
                classify_clients(&snapshot.clients, &bucket.client_keys, |first| {
                    first.year() == year && first.month() == month
                });
            let avg_ticket = if bucket.appointments > 0 {
                bucket.revenue / bucket.appointments as f64
            } else {
                0.0
            };
            MonthlyStat {
                month,
                year,
                appointments: bucket.appointments,
                revenue: bucket.revenue,
                unique_clients: bucket.client_keys.len() as i64,
                new_clients,
                returning_clients,
                avg_ticket,
            }
        })
        .collect()
}

pub fn client_rank_rows(snapshot: &AggregationSnapshot) -> Vec<ClientRankStat> {
    let mut buckets: BTreeMap<(i32, u32, String), (f64, i64)> = BTreeMap::new();
    for row in snapshot.active() {
        let Some(key) = &row.client_key else { continue };
        let entry = buckets
            .entry((row.date.year(), row.date.month(), key.clone()))
            .or_insert((0.0, 0));
        entry.0 += revenue_of(row) + tip_of(row);
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .map(|((year, month, client_key), (total_paid, visits))| {
            let client_name = snapshot
                .clients
                .get(&client_key)
                .map(|c| format!("{} {}", c.first_name.trim(), c.last_name.trim()))
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| client_key.clone());
            ClientRankStat {
                client_key,
                client_name,
                month,
                year,
                total_paid,
                visits,
            }
        })
        .collect()
}

pub fn service_rows(snapshot: &AggregationSnapshot) -> Vec<ServiceStat> {
    let mut buckets: BTreeMap<(String, i32, u32), (i64, f64)> = BTreeMap::new();
    for row in snapshot.active() {
        let entry = buckets
            .entry((row.service_type.clone(), row.date.year(), row.date.month()))
            .or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += revenue_of(row);
    }

    buckets
        .into_iter()
        .map(|((service_name, year, month), (bookings, revenue))| ServiceStat {
            service_name,
            month,
            year,
            bookings,
            revenue,
        })
        .collect()
}

/// Marketing-funnel attribution: one row per (source, month) counting clients
/// acquired in that month. Sources that are empty, "unknown", or
/// "returning client" are not acquisition events.
pub fn funnel_rows(snapshot: &AggregationSnapshot, range: DateRange) -> Vec<FunnelStat> {
    struct FunnelBucket {
        clients: BTreeSet<String>,
        names: BTreeSet<String>,
    }

    let mut buckets: BTreeMap<(String, String), FunnelBucket> = BTreeMap::new();
    for client in snapshot.clients.values() {
        let Some(first) = client.first_appt else { continue };
        if !range.contains(first) {
            continue;
        }
        let Some(source) = client.first_source.as_deref() else {
            continue;
        };
        if !is_acquisition_source(source) {
            continue;
        }

        let bucket = buckets
            .entry((source.trim().to_string(), month_period(first)))
            .or_insert_with(|| FunnelBucket {
                clients: BTreeSet::new(),
                names: BTreeSet::new(),
            });
        bucket.clients.insert(client.client_key.clone());
        let name = format!("{} {}", client.first_name.trim(), client.last_name.trim())
            .trim()
            .to_string();
        if !name.is_empty() {
            bucket.names.insert(name);
        }
    }

    buckets
        .into_iter()
        .map(|((source, period), bucket)| {
            // Average ticket over the cohort's appointments inside the
            // acquisition month.
            let mut total = 0.0;
            let mut count = 0i64;
            for row in snapshot.active() {
                let Some(key) = &row.client_key else { continue };
                if bucket.clients.contains(key) && month_period(row.date) == period {
                    total += revenue_of(row) + tip_of(row);
                    count += 1;
                }
            }
            let avg_ticket = if count > 0 { total / count as f64 } else { 0.0 };
            FunnelStat {
                source,
                period,
                new_clients: bucket.clients.len() as i64,
                client_names: bucket.names.into_iter().collect(),
                avg_ticket,
            }
        })
        .collect()
}

fn classify_clients<F>(
    clients: &HashMap<String, ClientRow>,
    keys: &BTreeSet<String>,
    first_in_bucket: F,
) -> (i64, i64)
where
    F: Fn(chrono::NaiveDate) -> bool,
{
    let mut new_clients = 0i64;
    let mut returning = 0i64;
    for key in keys {
        let is_new = clients
            .get(key)
            .and_then(|c| c.first_appt)
            .map(&first_in_bucket)
            .unwrap_or(false);
        if is_new {
            new_clients += 1;
        } else {
            returning += 1;
        }
    }
    (new_clients, returning)
}

async fn write_outcome(
    table: &'static str,
    upsert: impl Future<Output = Result<u64, StoreError>>,
) -> AggregationOutcome {
    match upsert.await {
        Ok(rows_written) => AggregationOutcome {
            table,
            rows_written,
            error: None,
        },
        Err(err) => {
            warn!(table, error = %err, "aggregation upsert failed; siblings continue");
            AggregationOutcome {
                table,
                rows_written: 0,
                error: Some(err.to_string()),
            }
        }
    }
}

/// Fan out the granularity-gated aggregations over one snapshot. Returns one
/// outcome per table that ran.
pub async fn run_aggregations(
    store: &dyn Store,
    tenant_id: &str,
    range: DateRange,
    granularity: Granularity,
) -> Result<Vec<AggregationOutcome>, StoreError> {
    let snapshot = AggregationSnapshot::load(store, tenant_id, range).await?;

    let daily = daily_rows(&snapshot);
    let weekly = granularity.includes_weekly().then(|| weekly_rows(&snapshot));
    let monthly_group = granularity.includes_monthly().then(|| {
        (
            monthly_rows(&snapshot),
            client_rank_rows(&snapshot),
            service_rows(&snapshot),
            funnel_rows(&snapshot, range),
        )
    });

    let daily_task = async {
        vec![write_outcome("daily_stats", store.upsert_daily_stats(tenant_id, &daily)).await]
    };
    let weekly_task = async {
        match &weekly {
            Some(rows) => {
                vec![write_outcome("weekly_stats", store.upsert_weekly_stats(tenant_id, rows)).await]
            }
            None => Vec::new(),
        }
    };
    let monthly_task = async {
        match &monthly_group {
            Some((monthly, ranks, services, funnels)) => {
                let (a, b, c, d) = tokio::join!(
                    write_outcome("monthly_stats", store.upsert_monthly_stats(tenant_id, monthly)),
                    write_outcome(
                        "client_rank_stats",
                        store.upsert_client_rank_stats(tenant_id, ranks)
                    ),
                    write_outcome("service_stats", store.upsert_service_stats(tenant_id, services)),
                    write_outcome("funnel_stats", store.upsert_funnel_stats(tenant_id, funnels)),
                );
                vec![a, b, c, d]
            }
            None => Vec::new(),
        }
    };

    let (mut outcomes, weekly_outcomes, monthly_outcomes) =
        tokio::join!(daily_task, weekly_task, monthly_task);
    outcomes.extend(weekly_outcomes);
    outcomes.extend(monthly_outcomes);
    Ok(outcomes)
}
