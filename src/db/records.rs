//! Postgres record store.
//!
//! The conditional stamp is a single `UPDATE ... WHERE last_queued_at IS
//! NULL OR last_queued_at < cutoff`. Under READ COMMITTED, a racing update
//! blocks on the row lock and then re-evaluates the predicate against the
//! committed token, so two dispatchers never both claim the same record.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::{Error, Result};
use crate::model::record::{
    Fence, FenceOutcome, Record, RecordFilter, RecordKind, RecordUpsert, RecordWrite,
};
use crate::store::RecordStore;

impl super::Db {
    /// Make sure every record of `kind` has a token row for `operation`.
    async fn seed_tokens(&self, kind: RecordKind, operation: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO record_refresh (kind, record_id, operation)
             SELECT kind, id, $2 FROM records WHERE kind = $1
             ON CONFLICT (kind, record_id, operation) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(operation)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for super::Db {
    async fn claim_stale(
        &self,
        kind: RecordKind,
        operation: &str,
        cutoff: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.seed_tokens(kind, operation).await?;
        let rows_affected = sqlx::query(
            "UPDATE record_refresh SET last_queued_at = $4
             WHERE kind = $1 AND operation = $2
               AND (last_queued_at IS NULL OR last_queued_at < $3)",
        )
        .bind(kind.as_str())
        .bind(operation)
        .bind(cutoff)
        .bind(queued_at)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn ids_queued_at(
        &self,
        kind: RecordKind,
        operation: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record_id FROM record_refresh
             WHERE kind = $1 AND operation = $2 AND last_queued_at = $3
             ORDER BY record_id",
        )
        .bind(kind.as_str())
        .bind(operation)
        .bind(queued_at)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn stamp(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.seed_tokens(kind, operation).await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE record_refresh SET last_queued_at = $3
             WHERE kind = $1 AND operation = $2
               AND ($4::text[] IS NULL OR record_id = ANY($4))
               AND (last_queued_at IS NULL OR last_queued_at < $3)
             RETURNING record_id",
        )
        .bind(kind.as_str())
        .bind(operation)
        .bind(queued_at)
        .bind(ids.map(<[String]>::to_vec))
        .fetch_all(self.pool())
        .await?;
        let mut stamped: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        stamped.sort();
        Ok(stamped)
    }

    async fn release_claim(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE record_refresh SET last_queued_at = NULL
             WHERE kind = $1 AND operation = $2 AND last_queued_at = $3
               AND ($4::text[] IS NULL OR record_id = ANY($4))",
        )
        .bind(kind.as_str())
        .bind(operation)
        .bind(queued_at)
        .bind(ids.map(<[String]>::to_vec))
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn clear_queued(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
    ) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE record_refresh SET last_queued_at = NULL
             WHERE kind = $1 AND operation = $2
               AND ($3::text[] IS NULL OR record_id = ANY($3))
               AND last_queued_at IS NOT NULL",
        )
        .bind(kind.as_str())
        .bind(operation)
        .bind(ids.map(<[String]>::to_vec))
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn last_queued_at(
        &self,
        kind: RecordKind,
        id: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT last_queued_at FROM record_refresh
             WHERE kind = $1 AND record_id = $2 AND operation = $3",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(operation)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.and_then(|(ts,)| ts))
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Record> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT kind, id, labels, data, parent_id, created_at, updated_at
             FROM records WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?
            .try_into_record()
    }

    async fn select(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Record>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT kind, id, labels, data, parent_id, created_at, updated_at
             FROM records
             WHERE kind = $1
               AND ($2::text[] IS NULL OR id = ANY($2))
               AND ($3::text IS NULL OR parent_id = $3)
             ORDER BY id",
        )
        .bind(kind.as_str())
        .bind(filter.ids.clone())
        .bind(filter.parent_id.clone())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(RecordRow::try_into_record).collect()
    }

    async fn apply_fenced(&self, fence: &Fence, writes: Vec<RecordWrite>) -> Result<FenceOutcome> {
        let mut tx = self.pool().begin().await?;

        // Row lock: no dispatcher can re-stamp this token until we commit.
        let current: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT last_queued_at FROM record_refresh
             WHERE kind = $1 AND record_id = $2 AND operation = $3
             FOR UPDATE",
        )
        .bind(fence.kind.as_str())
        .bind(&fence.id)
        .bind(&fence.operation)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = FenceOutcome::check(fence.queued_at, current.and_then(|(ts,)| ts));
        if !outcome.is_applied() {
            tx.rollback().await?;
            return Ok(outcome);
        }

        for write in writes {
            apply_write(&mut tx, write).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply(&self, writes: Vec<RecordWrite>) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for write in writes {
            apply_write(&mut tx, write).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_write(conn: &mut PgConnection, write: RecordWrite) -> Result<()> {
    match write {
        RecordWrite::Upsert(RecordUpsert {
            kind,
            id,
            labels,
            data,
            parent_id,
        }) => {
            sqlx::query(
                "INSERT INTO records (kind, id, labels, data, parent_id)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (kind, id) DO UPDATE SET
                     labels = records.labels || EXCLUDED.labels,
                     data = records.data || EXCLUDED.data,
                     parent_id = COALESCE(EXCLUDED.parent_id, records.parent_id),
                     updated_at = now()",
            )
            .bind(kind.as_str())
            .bind(id)
            .bind(serde_json::to_value(labels)?)
            .bind(serde_json::Value::Object(data))
            .bind(parent_id)
            .execute(&mut *conn)
            .await?;
        }
        RecordWrite::SetLabels { kind, id, labels } => {
            sqlx::query("UPDATE records SET labels = $3, updated_at = now() WHERE kind = $1 AND id = $2")
                .bind(kind.as_str())
                .bind(id)
                .bind(serde_json::to_value(labels)?)
                .execute(&mut *conn)
                .await?;
        }
        RecordWrite::Prune {
            kind,
            parent_id,
            keep,
        } => {
            sqlx::query(
                "DELETE FROM records
                 WHERE kind = $1
                   AND ($2::text IS NULL OR parent_id = $2)
                   AND NOT (id = ANY($3))",
            )
            .bind(kind.as_str())
            .bind(parent_id)
            .bind(keep)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecordRow {
    kind: String,
    id: String,
    labels: serde_json::Value,
    data: serde_json::Value,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecordRow {
    fn try_into_record(self) -> Result<Record> {
        let labels: BTreeMap<String, String> = serde_json::from_value(self.labels)?;
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(Error::Other(format!(
                    "record {} {} has non-object data: {other}",
                    self.kind, self.id
                )));
            }
        };
        Ok(Record {
            kind: self.kind.parse()?,
            id: self.id,
            labels,
            data,
            parent_id: self.parent_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
