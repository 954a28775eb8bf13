//! Postgres-backed [`Store`] implementation.
//!
//! All upserts go through `ON CONFLICT ... DO UPDATE` on the conflict key
//! documented on the trait. The manual-edit guard for appointment
//! financials lives in the upsert statement itself so a retried pull can
//! never race past it.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use tally_core::{
    ClientRankStat, DailyStat, DateRange, FunnelStat, MonthlyStat, ServiceStat, WeeklyStat,
};

use crate::{AppointmentRow, ClientRow, CredentialRow, Store, StoreError, TenantProfile};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn appointment_from_row(row: &PgRow) -> Result<AppointmentRow, sqlx::Error> {
    Ok(AppointmentRow {
        tenant_id: row.try_get("tenant_id")?,
        external_id: row.try_get("external_id")?,
        client_key: row.try_get("client_key")?,
        date: row.try_get("date")?,
        datetime: row.try_get("datetime")?,
        service_type: row.try_get("service_type")?,
        revenue: row.try_get("revenue")?,
        tip: row.try_get("tip")?,
        notes: row.try_get("notes")?,
        referral_source: row.try_get("referral_source")?,
        cancelled: row.try_get("cancelled")?,
        manually_edited: row.try_get("manually_edited")?,
        location_id: row.try_get("location_id")?,
        order_id: row.try_get("order_id")?,
        payment_id: row.try_get("payment_id")?,
        team_member_id: row.try_get("team_member_id")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn client_from_row(row: &PgRow) -> Result<ClientRow, sqlx::Error> {
    Ok(ClientRow {
        tenant_id: row.try_get("tenant_id")?,
        client_key: row.try_get("client_key")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        first_appt: row.try_get("first_appt")?,
        second_appt: row.try_get("second_appt")?,
        last_appt: row.try_get("last_appt")?,
        first_source: row.try_get("first_source")?,
        total_appointments: row.try_get("total_appointments")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn credential(
        &self,
        tenant_id: &str,
        platform: &str,
    ) -> Result<Option<CredentialRow>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, platform, access_token, refresh_token, expires_at, updated_at
             FROM connections WHERE tenant_id = $1 AND platform = $2",
        )
        .bind(tenant_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, sqlx::Error>(CredentialRow {
                tenant_id: r.try_get("tenant_id")?,
                platform: r.try_get("platform")?,
                access_token: r.try_get("access_token")?,
                refresh_token: r.try_get("refresh_token")?,
                expires_at: r.try_get("expires_at")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }

    async fn save_credential(&self, row: &CredentialRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO connections (tenant_id, platform, access_token, refresh_token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, platform)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.tenant_id)
        .bind(&row.platform)
        .bind(&row.access_token)
        .bind(&row.refresh_token)
        .bind(row.expires_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, platform, calendar_name, location_ids
             FROM tenant_profiles WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, sqlx::Error>(TenantProfile {
                tenant_id: r.try_get("tenant_id")?,
                platform: r.try_get("platform")?,
                calendar_name: r.try_get("calendar_name")?,
                location_ids: r.try_get("location_ids")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }

    async fn clients(&self, tenant_id: &str) -> Result<Vec<ClientRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant_id, client_key, email, phone, first_name, last_name,
                    first_appt, second_appt, last_appt, first_source, total_appointments
             FROM clients WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(client_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn upsert_clients(&self, rows: &[ClientRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO clients (
                    tenant_id, client_key, email, phone, first_name, last_name,
                    first_appt, second_appt, last_appt, first_source, total_appointments
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (tenant_id, client_key)
                DO UPDATE SET
                    email = EXCLUDED.email,
                    phone = EXCLUDED.phone,
                    first_name = EXCLUDED.first_name,
                    last_name = EXCLUDED.last_name,
                    first_appt = EXCLUDED.first_appt,
                    second_appt = EXCLUDED.second_appt,
                    last_appt = EXCLUDED.last_appt,
                    first_source = EXCLUDED.first_source,
                    total_appointments = EXCLUDED.total_appointments
                "#,
            )
            .bind(&row.tenant_id)
            .bind(&row.client_key)
            .bind(&row.email)
            .bind(&row.phone)
            .bind(&row.first_name)
            .bind(&row.last_name)
            .bind(row.first_appt)
            .bind(row.second_appt)
            .bind(row.last_appt)
            .bind(&row.first_source)
            .bind(row.total_appointments)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn appointments_in_range(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> Result<Vec<AppointmentRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM appointments
             WHERE tenant_id = $1 AND date >= $2 AND date <= $3",
        )
        .bind(tenant_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(appointment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn appointments_by_external_id(
        &self,
        tenant_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<AppointmentRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM appointments
             WHERE tenant_id = $1 AND external_id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(appointment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn appointment_counts(
        &self,
        tenant_id: &str,
        client_keys: &[String],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT client_key, COUNT(*) AS total FROM appointments
             WHERE tenant_id = $1 AND client_key = ANY($2)
             GROUP BY client_key",
        )
        .bind(tenant_id)
        .bind(client_keys)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let key: String = row.try_get("client_key")?;
            let total: i64 = row.try_get("total")?;
            counts.insert(key, total);
        }
        Ok(counts)
    }

    async fn upsert_appointments(&self, rows: &[AppointmentRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO appointments (
                    tenant_id, external_id, client_key, date, datetime, service_type,
                    revenue, tip, notes, referral_source, cancelled, manually_edited,
                    location_id, order_id, payment_id, team_member_id, status, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (tenant_id, external_id)
                DO UPDATE SET
                    client_key = EXCLUDED.client_key,
                    date = EXCLUDED.date,
                    datetime = EXCLUDED.datetime,
                    service_type = EXCLUDED.service_type,
                    revenue = CASE WHEN appointments.manually_edited
                                   THEN appointments.revenue ELSE EXCLUDED.revenue END,
                    tip = CASE WHEN appointments.manually_edited
                               THEN appointments.tip ELSE EXCLUDED.tip END,
                    notes = EXCLUDED.notes,
                    referral_source = EXCLUDED.referral_source,
                    cancelled = EXCLUDED.cancelled,
                    manually_edited = appointments.manually_edited,
                    location_id = EXCLUDED.location_id,
                    order_id = EXCLUDED.order_id,
                    payment_id = EXCLUDED.payment_id,
                    team_member_id = EXCLUDED.team_member_id,
                    status = EXCLUDED.status,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(&row.tenant_id)
            .bind(&row.external_id)
            .bind(&row.client_key)
            .bind(row.date)
            .bind(row.datetime)
            .bind(&row.service_type)
            .bind(row.revenue)
            .bind(row.tip)
            .bind(&row.notes)
            .bind(&row.referral_source)
            .bind(row.cancelled)
            .bind(row.manually_edited)
            .bind(&row.location_id)
            .bind(&row.order_id)
            .bind(&row.payment_id)
            .bind(&row.team_member_id)
            .bind(&row.status)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_daily_stats(
        &self,
        tenant_id: &str,
        rows: &[DailyStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO daily_stats (tenant_id, date, appointments, revenue, tips)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (tenant_id, date)
                DO UPDATE SET
                    appointments = EXCLUDED.appointments,
                    revenue = EXCLUDED.revenue,
                    tips = EXCLUDED.tips
                "#,
            )
            .bind(tenant_id)
            .bind(row.date)
            .bind(row.appointments)
            .bind(row.revenue)
            .bind(row.tips)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_weekly_stats(
        &self,
        tenant_id: &str,
        rows: &[WeeklyStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO weekly_stats (
                    tenant_id, week_number, month, year, week_start, week_end,
                    appointments, revenue, new_clients, returning_clients
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (tenant_id, week_number, month, year)
                DO UPDATE SET
                    week_start = EXCLUDED.week_start,
                    week_end = EXCLUDED.week_end,
                    appointments = EXCLUDED.appointments,
                    revenue = EXCLUDED.revenue,
                    new_clients = EXCLUDED.new_clients,
                    returning_clients = EXCLUDED.returning_clients
                "#,
            )
            .bind(tenant_id)
            .bind(row.week_number as i32)
            .bind(row.month as i32)
            .bind(row.year)
            .bind(row.week_start)
            .bind(row.week_end)
            .bind(row.appointments)
            .bind(row.revenue)
            .bind(row.new_clients)
            .bind(row.returning_clients)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_monthly_stats(
        &self,
        tenant_id: &str,
        rows: &[MonthlyStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO monthly_stats (
                    tenant_id, month, year, appointments, revenue,
                    unique_clients, new_clients, returning_clients, avg_ticket
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, month, year)
                DO UPDATE SET
                    appointments = EXCLUDED.appointments,
                    revenue = EXCLUDED.revenue,
                    unique_clients = EXCLUDED.unique_clients,
                    new_clients = EXCLUDED.new_clients,
                    returning_clients = EXCLUDED.returning_clients,
                    avg_ticket = EXCLUDED.avg_ticket
                "#,
            )
            .bind(tenant_id)
            .bind(row.month as i32)
            .bind(row.year)
            .bind(row.appointments)
            .bind(row.revenue)
            .bind(row.unique_clients)
            .bind(row.new_clients)
            .bind(row.returning_clients)
            .bind(row.avg_ticket)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_client_rank_stats(
        &self,
        tenant_id: &str,
        rows: &[ClientRankStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO client_rank_stats (
                    tenant_id, month, year, client_key, client_name, total_paid, visits
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (tenant_id, month, year, client_key)
                DO UPDATE SET
                    client_name = EXCLUDED.client_name,
                    total_paid = EXCLUDED.total_paid,
                    visits = EXCLUDED.visits
                "#,
            )
            .bind(tenant_id)
            .bind(row.month as i32)
            .bind(row.year)
            .bind(&row.client_key)
            .bind(&row.client_name)
            .bind(row.total_paid)
            .bind(row.visits)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_service_stats(
        &self,
        tenant_id: &str,
        rows: &[ServiceStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO service_stats (
                    tenant_id, service_name, month, year, bookings, revenue
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (tenant_id, service_name, month, year)
                DO UPDATE SET
                    bookings = EXCLUDED.bookings,
                    revenue = EXCLUDED.revenue
                "#,
            )
            .bind(tenant_id)
            .bind(&row.service_name)
            .bind(row.month as i32)
            .bind(row.year)
            .bind(row.bookings)
            .bind(row.revenue)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_funnel_stats(
        &self,
        tenant_id: &str,
        rows: &[FunnelStat],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO funnel_stats (
                    tenant_id, source, period, new_clients, client_names, avg_ticket
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (tenant_id, source, period)
                DO UPDATE SET
                    new_clients = EXCLUDED.new_clients,
                    client_names = EXCLUDED.client_names,
                    avg_ticket = EXCLUDED.avg_ticket
                "#,
            )
            .bind(tenant_id)
            .bind(&row.source)
            .bind(&row.period)
            .bind(row.new_clients)
            .bind(&row.client_names)
            .bind(row.avg_ticket)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }
}
