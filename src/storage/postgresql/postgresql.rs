use crate::datamodel::{LabelSet, Row, SeriesId};
use crate::storage::error::StorageError;
use crate::storage::store::SeriesStore;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row as SqlxRow};
use std::time::Duration;
use tracing::debug;

/// PostgreSQL/TimescaleDB storage backend.
///
/// Series identities live in one shared `series` table; each metric gets
/// its own data table, turned into a hypertable when the timescaledb
/// extension is installed.
#[derive(Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Quoted identifier of the data table for a metric name.
    fn data_table(metric: &str) -> String {
        format!("\"metric_{}\"", metric.replace('"', "\"\""))
    }
}

#[async_trait]
impl SeriesStore for PostgresStore {
    async fn create_or_migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series (
                series_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                metric_name TEXT NOT NULL,
                labels JSONB NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS series_metric_name_idx
            ON series (metric_name)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn series_id_or_create(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StorageError> {
        let canonical = labels.to_canonical_json();

        // Single idempotent round trip: insert wins or the concurrent
        // writer's row is returned, never insert-then-fetch.
        let query = sqlx::query(
            r#"
            WITH inserted AS (
                INSERT INTO series (metric_name, labels)
                VALUES ($1, $2)
                ON CONFLICT (labels) DO NOTHING
                RETURNING series_id
            )
            SELECT series_id FROM inserted
            UNION ALL
            SELECT series_id FROM series WHERE labels = $2
            LIMIT 1
            "#,
        )
        .bind(metric)
        .bind(&canonical);

        let series_id = query.fetch_one(&self.pool).await?.get("series_id");
        Ok(series_id)
    }

    async fn create_metric_table(&self, metric: &str) -> Result<(), StorageError> {
        let table = Self::data_table(metric);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                series_id BIGINT NOT NULL,
                timestamp_ms BIGINT NOT NULL,
                value DOUBLE PRECISION NOT NULL
            )
            "#,
        ))
        .execute(&self.pool)
        .await?;

        let index = format!("\"metric_{}_series_ts_idx\"", metric.replace('"', "\"\""));
        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS {index} ON {table} (series_id, timestamp_ms)
            "#,
        ))
        .execute(&self.pool)
        .await?;

        // Best effort: plain PostgreSQL without the extension stays a
        // regular table.
        let hypertable = sqlx::query(&format!(
            r#"
            SELECT create_hypertable('{}', by_range('timestamp_ms', 86400000), if_not_exists => TRUE)
            "#,
            table.replace('\'', "''"),
        ))
        .execute(&self.pool)
        .await;
        if let Err(err) = hypertable {
            debug!(metric, error = %err, "create_hypertable skipped");
        }

        Ok(())
    }

    async fn copy_rows(&self, metric: &str, rows: &[Row]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = Self::data_table(metric);

        let mut series_ids = Vec::with_capacity(rows.len());
        let mut timestamps = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            series_ids.push(row.series_id);
            timestamps.push(row.timestamp_ms);
            values.push(row.value);
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (series_id, timestamp_ms, value)
            SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::DOUBLE PRECISION[])
            "#,
        ))
        .bind(&series_ids)
        .bind(&timestamps)
        .bind(&values)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_table_quoting() {
        assert_eq!(
            PostgresStore::data_table("cpu_seconds_total"),
            "\"metric_cpu_seconds_total\""
        );
        // Embedded quotes must not break out of the identifier.
        assert_eq!(
            PostgresStore::data_table("evil\"metric"),
            "\"metric_evil\"\"metric\""
        );
    }
}
