use anyhow::Result;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

use crate::audit::IncidentRecord;

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>) -> Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(5))
        .connect(url)
        .await?;

    Ok(pool)
}

/// Create the audit schema if it is missing (idempotent).
pub async fn ensure_tables(db: &Db) -> Result<()> {
    sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS tss;"#)
        .execute(db)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tss.raidguard_incidents (
          id          BIGSERIAL PRIMARY KEY,
          guild_id    BIGINT      NOT NULL,
          kind        TEXT        NOT NULL,
          count       BIGINT      NOT NULL DEFAULT 0,
          threshold   BIGINT      NOT NULL DEFAULT 0,
          occurred_at TEXT        NOT NULL,
          data        JSONB       NOT NULL DEFAULT '{}'::jsonb,
          created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raidguard_incidents_gid_created
          ON tss.raidguard_incidents (guild_id, created_at DESC);
        "#,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Insert an incident and return its id.
pub async fn insert_incident(db: &Db, incident: &IncidentRecord) -> Result<i64> {
    let rec: (i64,) = sqlx::query_as(
        "INSERT INTO tss.raidguard_incidents (guild_id, kind, count, threshold, occurred_at, data) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
    )
    .bind(incident.guild_id as i64)
    .bind(incident.kind.as_str())
    .bind(incident.count as i64)
    .bind(incident.threshold as i64)
    .bind(incident.at.to_rfc3339())
    .bind(&incident.detail)
    .fetch_one(db)
    .await?;
    Ok(rec.0)
}
