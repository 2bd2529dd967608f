//! Postgres-backed [`DeliveryStore`].
//!
//! - Materialization uses `INSERT ... ON CONFLICT DO NOTHING` on the
//!   `(broadcast_id, recipient_id, channel)` key, one statement per batch.
//! - Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
//!   lease the same record.
//! - Counter increments are single-row `SET n = n + 1` updates inside the
//!   short transaction that also moves the record; no I/O happens inside it.
//! - Every transaction that touches both tables locks `delivery_records`
//!   rows (in id order when there are several) before the `broadcasts` row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Broadcast, BroadcastStatus, ChannelType, DeliveryRecord, DeliveryStatus, ErrorLogEntry,
};

use super::{
    CompletionPolicy, DeliveryStore, ErrorCount, Expect, ProgressSnapshot, RecordPage,
    StatusCounts, Transition, WindowUsage,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    policy: CompletionPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, policy: CompletionPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn expected_lease(expect: Expect) -> Option<Uuid> {
        match expect {
            Expect::Lease(lease) => Some(lease),
            Expect::Pending => None,
        }
    }

    /// Explain why a guarded update matched nothing.
    async fn classify_miss(
        conn: &mut PgConnection,
        record_id: Uuid,
    ) -> Result<Transition, sqlx::Error> {
        let status: Option<(DeliveryStatus,)> =
            sqlx::query_as("SELECT status FROM delivery_records WHERE id = $1")
                .bind(record_id)
                .fetch_optional(conn)
                .await?;

        Ok(match status {
            Some((DeliveryStatus::Cancelled,)) => Transition::Cancelled,
            _ => Transition::StaleLease,
        })
    }

    /// Close the broadcast once every record is accounted for.
    async fn complete_if_finished(
        conn: &mut PgConnection,
        broadcast_id: Uuid,
        now: DateTime<Utc>,
        policy: CompletionPolicy,
    ) -> Result<(), sqlx::Error> {
        let finished: Option<(BroadcastStatus, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET status = CASE
                    WHEN $3::float8 IS NOT NULL
                         AND recipient_count > 0
                         AND failed_count::float8 > $3::float8 * recipient_count::float8
                    THEN 'failed'
                    ELSE 'completed'
                END,
                completed_at = $2,
                updated_at = $2
            WHERE id = $1
              AND status = 'sending'
              AND materialized_at IS NOT NULL
              AND sent_count + failed_count >= recipient_count
            RETURNING status, sent_count, failed_count
            "#,
        )
        .bind(broadcast_id)
        .bind(now)
        .bind(policy.failure_threshold)
        .fetch_optional(conn)
        .await?;

        if let Some((status, sent, failed)) = finished {
            tracing::info!(
                broadcast_id = %broadcast_id,
                status = %status,
                sent,
                failed,
                "Broadcast finished"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn insert_broadcast(&self, b: &Broadcast) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO broadcasts (
                id, creator_id, title, message, kind, priority, related_object, target_spec,
                channels, status, recipient_count, sent_count, failed_count, max_attempts,
                error_log, scheduled_at, sent_at, materialized_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(b.id)
        .bind(b.creator_id)
        .bind(&b.title)
        .bind(&b.message)
        .bind(b.kind.to_string())
        .bind(b.priority.to_string())
        .bind(Json(&b.related_object))
        .bind(Json(&b.target_spec))
        .bind(Json(&b.channels))
        .bind(b.status.to_string())
        .bind(b.recipient_count)
        .bind(b.sent_count)
        .bind(b.failed_count)
        .bind(b.max_attempts)
        .bind(Json(&b.error_log))
        .bind(b.scheduled_at)
        .bind(b.sent_at)
        .bind(b.materialized_at)
        .bind(b.completed_at)
        .bind(b.created_at)
        .bind(b.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_broadcast(&self, id: Uuid) -> Result<Option<Broadcast>, AppError> {
        let broadcast = sqlx::query_as("SELECT * FROM broadcasts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(broadcast)
    }

    async fn claim_due_broadcasts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError> {
        let claimed: Vec<Broadcast> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET status = 'sending', sent_at = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM broadcasts
                WHERE status = 'draft'
                  AND (scheduled_at IS NULL OR scheduled_at <= $1)
                ORDER BY COALESCE(scheduled_at, created_at)
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn reclaim_unmaterialized(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError> {
        let reclaimed: Vec<Broadcast> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET sent_at = $2, updated_at = $2
            WHERE id IN (
                SELECT id FROM broadcasts
                WHERE status = 'sending'
                  AND materialized_at IS NULL
                  AND sent_at < $1
                ORDER BY sent_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(reclaimed)
    }

    async fn finish_materialization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Broadcast>, AppError> {
        let mut tx = self.pool.begin().await?;

        let opened: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET recipient_count = (SELECT COUNT(*) FROM delivery_records WHERE broadcast_id = $1),
                materialized_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'sending'
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if opened.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        // A zero-recipient broadcast finishes right here.
        Self::complete_if_finished(&mut tx, id, now, self.policy).await?;

        let broadcast: Broadcast = sqlx::query_as("SELECT * FROM broadcasts WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(broadcast))
    }

    async fn fail_broadcast(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        entry: &ErrorLogEntry,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = 'failed',
                completed_at = $2,
                updated_at = $2,
                error_log = error_log || $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_error_log(
        &self,
        id: Uuid,
        entries: &[ErrorLogEntry],
    ) -> Result<(), AppError> {
        if entries.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE broadcasts SET error_log = error_log || $2 WHERE id = $1")
            .bind(id)
            .bind(Json(entries))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn cancel_broadcast(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, AppError> {
        let mut tx = self.pool.begin().await?;

        // Records before the broadcast row, in id order: the same order the
        // settlement paths take, so a cancel never waits on them in a cycle.
        let records = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'cancelled', processed_at = $2, lease_id = NULL
            WHERE id IN (
                SELECT id FROM delivery_records
                WHERE broadcast_id = $1 AND status IN ('pending', 'processing')
                  AND EXISTS (
                        SELECT 1 FROM broadcasts
                        WHERE id = $1 AND status IN ('draft', 'sending')
                  )
                ORDER BY id
                FOR UPDATE
            )
            AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let cancelled: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('draft', 'sending')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if cancelled.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(records))
    }

    async fn reset_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>, AppError> {
        let mut tx = self.pool.begin().await?;

        let rearmed = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'pending', attempts = 0, scheduled_at = $2, error_message = NULL,
                processed_at = NULL, lease_id = NULL, locked_at = NULL
            WHERE id IN (
                SELECT id FROM delivery_records
                WHERE broadcast_id = $1 AND status = 'failed'
                  AND EXISTS (
                        SELECT 1 FROM broadcasts
                        WHERE id = $1 AND status IN ('completed', 'failed')
                  )
                ORDER BY id
                FOR UPDATE
            )
            AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let reopened: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE broadcasts
            SET failed_count = failed_count - $2,
                status = CASE WHEN $2 > 0 THEN 'sending' ELSE status END,
                completed_at = CASE WHEN $2 > 0 THEN NULL ELSE completed_at END,
                updated_at = $3
            WHERE id = $1 AND status IN ('completed', 'failed')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(rearmed as i64)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if reopened.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(rearmed))
    }

    async fn insert_records(
        &self,
        broadcast_id: Uuid,
        channel: ChannelType,
        recipients: &[Uuid],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let ids: Vec<Uuid> = recipients.iter().map(|_| Uuid::new_v4()).collect();

        let created = sqlx::query(
            r#"
            INSERT INTO delivery_records
                (id, broadcast_id, recipient_id, channel, status, attempts, max_attempts, scheduled_at, created_at)
            SELECT r.id, $1, r.recipient_id, $2, 'pending', 0, $3, $4, $4
            FROM UNNEST($5::uuid[], $6::uuid[]) AS r(id, recipient_id)
            ON CONFLICT (broadcast_id, recipient_id, channel) DO NOTHING
            "#,
        )
        .bind(broadcast_id)
        .bind(channel.to_string())
        .bind(max_attempts)
        .bind(now)
        .bind(&ids)
        .bind(recipients)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(created)
    }

    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let mut records: Vec<DeliveryRecord> = sqlx::query_as(
            r#"
            UPDATE delivery_records
            SET status = 'processing', lease_id = $3, locked_at = $1
            WHERE id IN (
                SELECT dr.id
                FROM delivery_records dr
                JOIN broadcasts b ON b.id = dr.broadcast_id
                WHERE dr.status = 'pending'
                  AND dr.scheduled_at <= $1
                  AND b.status = 'sending'
                  AND b.materialized_at IS NOT NULL
                ORDER BY dr.scheduled_at
                LIMIT $2
                FOR UPDATE OF dr SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(lease)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|r| r.scheduled_at);
        Ok(records)
    }

    async fn window_usage(
        &self,
        recipient: Uuid,
        channel: ChannelType,
        since: DateTime<Utc>,
        lease: Uuid,
    ) -> Result<WindowUsage, AppError> {
        let (count, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(COALESCE(processed_at, locked_at))
            FROM delivery_records
            WHERE recipient_id = $1
              AND channel = $2
              AND (
                    (status = 'sent' AND processed_at > $3)
                 OR (status = 'processing' AND lease_id IS DISTINCT FROM $4 AND locked_at > $3)
              )
            "#,
        )
        .bind(recipient)
        .bind(channel.to_string())
        .bind(since)
        .bind(lease)
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowUsage {
            count: count.max(0) as u32,
            oldest,
        })
    }

    async fn mark_sent(
        &self,
        record_id: Uuid,
        lease: Uuid,
        now: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<Transition, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE delivery_records
            SET status = 'sent', processed_at = $3, provider_message_id = $4,
                error_message = NULL, lease_id = NULL
            WHERE id = $1 AND status = 'processing' AND lease_id = $2
            RETURNING broadcast_id
            "#,
        )
        .bind(record_id)
        .bind(lease)
        .bind(now)
        .bind(provider_message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((broadcast_id,)) = updated else {
            let transition = Self::classify_miss(&mut tx, record_id).await?;
            tx.rollback().await?;
            return Ok(transition);
        };

        sqlx::query(
            "UPDATE broadcasts SET sent_count = sent_count + 1, updated_at = $2 WHERE id = $1",
        )
        .bind(broadcast_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::complete_if_finished(&mut tx, broadcast_id, now, self.policy).await?;
        tx.commit().await?;
        Ok(Transition::Applied)
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid, Uuid, ChannelType)> = sqlx::query_as(
            r#"
            UPDATE delivery_records
            SET status = 'failed', attempts = $3, processed_at = $4, error_message = $5,
                lease_id = NULL
            WHERE id = $1
              AND (
                    ($2::uuid IS NOT NULL AND status = 'processing' AND lease_id = $2)
                 OR ($2::uuid IS NULL AND status = 'pending')
              )
            RETURNING broadcast_id, recipient_id, channel
            "#,
        )
        .bind(record_id)
        .bind(Self::expected_lease(expect))
        .bind(attempts)
        .bind(now)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((broadcast_id, recipient_id, channel)) = updated else {
            let transition = Self::classify_miss(&mut tx, record_id).await?;
            tx.rollback().await?;
            return Ok(transition);
        };

        let entry = ErrorLogEntry {
            timestamp: now,
            recipient_id: Some(recipient_id),
            channel: Some(channel),
            reason: reason.to_string(),
        };

        sqlx::query(
            r#"
            UPDATE broadcasts
            SET failed_count = failed_count + 1,
                error_log = error_log || $3,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(broadcast_id)
        .bind(now)
        .bind(Json(vec![entry]))
        .execute(&mut *tx)
        .await?;

        Self::complete_if_finished(&mut tx, broadcast_id, now, self.policy).await?;
        tx.commit().await?;
        Ok(Transition::Applied)
    }

    async fn reschedule(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<Transition, AppError> {
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'pending', attempts = $3, scheduled_at = $4,
                error_message = COALESCE($5, error_message),
                lease_id = NULL, locked_at = NULL
            WHERE id = $1
              AND (
                    ($2::uuid IS NOT NULL AND status = 'processing' AND lease_id = $2)
                 OR ($2::uuid IS NULL AND status = 'pending')
              )
            "#,
        )
        .bind(record_id)
        .bind(Self::expected_lease(expect))
        .bind(attempts)
        .bind(at)
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Transition::Applied);
        }
        Ok(Self::classify_miss(&mut conn, record_id).await?)
    }

    async fn list_stalled(
        &self,
        locked_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT * FROM delivery_records
            WHERE status = 'processing' AND locked_at < $1
            ORDER BY locked_at
            LIMIT $2
            "#,
        )
        .bind(locked_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_exhausted(&self, limit: i64) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT * FROM delivery_records
            WHERE status = 'pending' AND attempts >= max_attempts
            ORDER BY scheduled_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_records
            WHERE status IN ('sent', 'failed', 'cancelled') AND processed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_job_slot(
        &self,
        job: &str,
        now: DateTime<Utc>,
        min_interval: chrono::Duration,
    ) -> Result<bool, AppError> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO scheduler_state (job, last_run, updated_at)
            VALUES ($1, $2, $2)
            ON CONFLICT (job) DO UPDATE
                SET last_run = EXCLUDED.last_run, updated_at = EXCLUDED.updated_at
                WHERE scheduler_state.last_run <= $3
            RETURNING job
            "#,
        )
        .bind(job)
        .bind(now)
        .bind(now - min_interval)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn progress_snapshot(
        &self,
        id: Uuid,
        top_errors: i64,
    ) -> Result<Option<ProgressSnapshot>, AppError> {
        let mut tx = self.pool.begin().await?;

        // All three reads see the same snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let broadcast: Option<Broadcast> = sqlx::query_as("SELECT * FROM broadcasts WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(broadcast) = broadcast else {
            tx.rollback().await?;
            return Ok(None);
        };

        let rows: Vec<(DeliveryStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM delivery_records WHERE broadcast_id = $1 GROUP BY status",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status, n);
        }

        let errors: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(error_message, 'unknown error') AS message, COUNT(*) AS count
            FROM delivery_records
            WHERE broadcast_id = $1 AND status = 'failed'
            GROUP BY 1
            ORDER BY count DESC, message
            LIMIT $2
            "#,
        )
        .bind(id)
        .bind(top_errors)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ProgressSnapshot {
            broadcast,
            counts,
            errors: errors
                .into_iter()
                .map(|(message, count)| ErrorCount { message, count })
                .collect(),
        }))
    }

    async fn list_records(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<RecordPage, AppError> {
        let status = status.map(|s| s.to_string());

        let records: Vec<DeliveryRecord> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_records
            WHERE broadcast_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at, id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(broadcast_id)
        .bind(&status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM delivery_records WHERE broadcast_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(broadcast_id)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecordPage { records, total })
    }
}
