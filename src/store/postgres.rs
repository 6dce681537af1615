//! PostgreSQL / TimescaleDB store
//!
//! Owns the `sqlx` connection pool shared by every component of the client.
//!
//! # Pool configuration
//!
//! - `min_connections` / `max_connections` bound the pool
//! - with the statement cache enabled each connection keeps up to
//!   `statement_cache_capacity` prepared statements, and an after-release
//!   hook samples cache occupancy into a histogram
//! - with it disabled the capacity is zero, so statements are never kept
//!   server side
//! - an optional [`ConnectHook`] runs once on every new physical connection
//!   before it is handed out (used to take the schema advisory lock)
//!
//! # Identifier upserts
//!
//! All `get_or_create_*` operations run `INSERT .. ON CONFLICT DO NOTHING`
//! followed by a separate `SELECT`. Each statement autocommits, so the
//! reselect runs on a fresh snapshot and sees a row inserted by a racing
//! caller. Uniqueness constraints on every catalog table make concurrent
//! misses for the same key converge on one id.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::util::redact_connection_string;
use super::{
    CopyBatch, CopyReport, DatabaseStats, ExemplarRow, SeriesSamples, SeriesSelector, Store,
};
use crate::config::{ConnectionCounts, DatabaseConfig};
use crate::error::{Error, StoreError};
use crate::metrics;
use crate::telemetry::TelemetryReport;
use crate::types::{Label, LabelId, Labels, MetricId, Sample, SeriesId, TimeSeries, TraceBatch};

/// Function run on every new physical connection before first use
pub type ConnectHook =
    Arc<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync>;

/// Advisory lock key held (shared) by every client connection while it is open
pub const SCHEMA_LOCK_ID: i64 = 0x7072_6f6d_7374;

/// SQLSTATE `feature_not_supported`, raised on writes into compressed chunks
const FEATURE_NOT_SUPPORTED: &str = "0A000";

/// Hook that takes the shared schema advisory lock for the connection's lifetime
///
/// Schema migrations take the same lock exclusively, so they never run while
/// a client is connected.
pub fn schema_lock_hook() -> ConnectHook {
    Arc::new(take_schema_lock)
}

fn take_schema_lock(conn: &mut PgConnection) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(async move {
        sqlx::query("SELECT pg_advisory_lock_shared($1)")
            .bind(SCHEMA_LOCK_ID)
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

const SCHEMA: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS ts_catalog",
    "CREATE SCHEMA IF NOT EXISTS ts_data",
    "CREATE SCHEMA IF NOT EXISTS ts_trace",
    "CREATE TABLE IF NOT EXISTS ts_catalog.metric (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS ts_catalog.label (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (key, value))",
    "CREATE TABLE IF NOT EXISTS ts_catalog.series (
        id BIGSERIAL PRIMARY KEY,
        metric_id BIGINT NOT NULL REFERENCES ts_catalog.metric (id),
        labels BIGINT[] NOT NULL,
        UNIQUE (metric_id, labels))",
    "CREATE INDEX IF NOT EXISTS series_labels_idx ON ts_catalog.series USING GIN (labels)",
    "CREATE TABLE IF NOT EXISTS ts_catalog.exemplar_label_key_position (
        metric_name TEXT NOT NULL,
        key TEXT NOT NULL,
        pos INTEGER NOT NULL,
        PRIMARY KEY (metric_name, key))",
    "CREATE TABLE IF NOT EXISTS ts_catalog.ids_epoch (
        is_unique BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (is_unique),
        current_epoch BIGINT NOT NULL)",
    "INSERT INTO ts_catalog.ids_epoch (current_epoch) VALUES (0) ON CONFLICT DO NOTHING",
    "CREATE TABLE IF NOT EXISTS ts_catalog.telemetry (
        instance_id UUID PRIMARY KEY,
        report JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS ts_data.sample (
        series_id BIGINT NOT NULL,
        time TIMESTAMPTZ NOT NULL,
        value DOUBLE PRECISION NOT NULL)",
    "CREATE TABLE IF NOT EXISTS ts_data.exemplar (
        series_id BIGINT NOT NULL,
        time TIMESTAMPTZ NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        label_values JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS ts_trace.span (
        trace_id TEXT NOT NULL,
        span_id TEXT NOT NULL,
        parent_span_id TEXT NOT NULL,
        name TEXT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        attributes JSONB NOT NULL,
        resource JSONB NOT NULL,
        scope_name TEXT NOT NULL,
        scope_version TEXT NOT NULL)",
];

const HYPERTABLES: &[(&str, &str)] = &[
    ("ts_data.sample", "time"),
    ("ts_data.exemplar", "time"),
    ("ts_trace.span", "start_time"),
];

/// Map driver errors onto the store taxonomy
fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::PoolTimeout,
        sqlx::Error::PoolClosed => StoreError::Closed,
        sqlx::Error::Database(ref db)
            if db.code().as_deref() == Some(FEATURE_NOT_SUPPORTED)
                && db.message().contains("compressed") =>
        {
            StoreError::ChunkCompressed {
                table: db.table().unwrap_or("sample").to_string(),
                chunk: db.message().to_string(),
            }
        },
        other => StoreError::Database(other),
    }
}

/// Record the statement cache occupancy of a connection going back to the pool
fn observe_statement_cache(conn: &PgConnection) {
    metrics::observe_statement_cache_len(conn.cached_statements_size());
}

/// PostgreSQL-backed [`Store`]
pub struct PgStore {
    pool: PgPool,
    counts: Option<ConnectionCounts>,
}

impl PgStore {
    /// Build the pool and open the first connection
    ///
    /// Fails with [`Error::Configuration`] for a malformed connection string or
    /// invalid pool bounds and with [`Error::Connect`] when the server cannot
    /// be reached.
    pub async fn connect(
        db: &DatabaseConfig,
        requested_copiers: usize,
        hook: Option<ConnectHook>,
    ) -> Result<Self, Error> {
        let counts = db.num_connections(requested_copiers).map_err(|e| {
            error!(error = %e, "configuring number of connections");
            e
        })?;

        let redacted = redact_connection_string(&db.url);
        let options = PgConnectOptions::from_str(&db.url).map_err(|e| {
            error!(connection = %redacted, error = %e, "configuring connection");
            Error::Configuration(format!("invalid connection string {}: {}", redacted, e))
        })?;

        let (options, statement_cache) = if db.statement_cache_enabled {
            metrics::set_statement_cache_state(true, db.statement_cache_capacity);
            (
                options.statement_cache_capacity(db.statement_cache_capacity),
                format!("{} statements", db.statement_cache_capacity),
            )
        } else {
            info!("statement cache disabled, database connections will not keep prepared statements");
            metrics::set_statement_cache_state(false, 0);
            // sqlx always speaks the extended protocol; a zero-capacity cache
            // (unnamed statements, nothing kept per connection) is the closest
            // it gets to the simple query protocol
            (options.statement_cache_capacity(0), "disabled".to_string())
        };

        let mut pool_options = PgPoolOptions::new()
            .min_connections(counts.min)
            .max_connections(counts.max)
            .acquire_timeout(db.acquire_timeout());

        if db.statement_cache_enabled {
            pool_options = pool_options.after_release(|conn, _meta| {
                Box::pin(async move {
                    observe_statement_cache(conn);
                    Ok(true)
                })
            });
        }

        if let Some(hook) = hook {
            pool_options = pool_options.after_connect(move |conn, _meta| hook(conn));
        }

        info!(
            connection = %redacted,
            num_copiers = counts.num_copiers,
            pool_max_conns = counts.max,
            pool_min_conns = counts.min,
            statement_cache = %statement_cache,
            "configured connection pool"
        );

        let pool = match tokio::time::timeout(db.connect_timeout(), pool_options.connect_with(options))
            .await
        {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                error!(connection = %redacted, error = %e, "creating connection pool");
                return Err(Error::Connect(e.to_string()));
            },
            Err(_) => {
                error!(connection = %redacted, timeout = ?db.connect_timeout(), "creating connection pool timed out");
                return Err(Error::Connect(format!(
                    "timed out after {:?} connecting to {}",
                    db.connect_timeout(),
                    redacted
                )));
            },
        };

        let store = Self {
            pool,
            counts: Some(counts),
        };
        if db.install_schema {
            store.install_schema().await?;
        }
        Ok(store)
    }

    /// Wrap a pool created elsewhere
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, counts: None }
    }

    /// Pool sizing resolved at connect time, `None` for wrapped pools
    pub fn counts(&self) -> Option<ConnectionCounts> {
        self.counts
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create schemas and tables; hypertables when TimescaleDB is installed
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        if self.has_timescaledb().await? {
            for (table, column) in HYPERTABLES {
                sqlx::query(
                    "SELECT create_hypertable($1::regclass, $2::name, if_not_exists => TRUE)",
                )
                .bind(*table)
                .bind(*column)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            }
        }
        debug!("schema installed");
        Ok(())
    }

    async fn has_timescaledb(&self) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    /// Time ranges `[start, end)` in milliseconds of compressed chunks of a table
    async fn compressed_ranges(&self, table: &str) -> Result<Vec<(i64, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT (extract(epoch FROM range_start) * 1000)::bigint AS start_ms,
                    (extract(epoch FROM range_end) * 1000)::bigint AS end_ms
             FROM timescaledb_information.chunks
             WHERE hypertable_schema = 'ts_data' AND hypertable_name = $1 AND is_compressed",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|r| Ok::<_, sqlx::Error>((r.try_get::<i64, _>("start_ms")?, r.try_get::<i64, _>("end_ms")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_sqlx)
    }

    /// Insert all rows in one transaction
    async fn copy_once(&self, batch: &CopyBatch) -> Result<u64, StoreError> {
        let mut series_ids = Vec::new();
        let mut times = Vec::new();
        let mut values = Vec::new();
        for rows in &batch.samples {
            for sample in &rows.samples {
                series_ids.push(rows.series_id);
                times.push(sample.timestamp);
                values.push(sample.value);
            }
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if !series_ids.is_empty() {
            sqlx::query(
                "INSERT INTO ts_data.sample (series_id, time, value)
                 SELECT s, to_timestamp(t::float8 / 1000.0), v
                 FROM UNNEST($1::bigint[], $2::bigint[], $3::float8[]) AS u(s, t, v)",
            )
            .bind(&series_ids)
            .bind(&times)
            .bind(&values)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        if !batch.exemplars.is_empty() {
            let mut ex_series = Vec::with_capacity(batch.exemplars.len());
            let mut ex_times = Vec::with_capacity(batch.exemplars.len());
            let mut ex_values = Vec::with_capacity(batch.exemplars.len());
            let mut ex_labels = Vec::with_capacity(batch.exemplars.len());
            for row in &batch.exemplars {
                ex_series.push(row.series_id);
                ex_times.push(row.timestamp);
                ex_values.push(row.value);
                ex_labels.push(
                    serde_json::to_string(&row.label_values)
                        .map_err(|e| StoreError::Query(e.to_string()))?,
                );
            }
            sqlx::query(
                "INSERT INTO ts_data.exemplar (series_id, time, value, label_values)
                 SELECT s, to_timestamp(t::float8 / 1000.0), v, l::jsonb
                 FROM UNNEST($1::bigint[], $2::bigint[], $3::float8[], $4::text[]) AS u(s, t, v, l)",
            )
            .bind(&ex_series)
            .bind(&ex_times)
            .bind(&ex_values)
            .bind(&ex_labels)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(series_ids.len() as u64)
    }
}

fn in_ranges(ranges: &[(i64, i64)], ts: i64) -> bool {
    ranges.iter().any(|(start, end)| ts >= *start && ts < *end)
}

/// Drop rows that fall inside compressed ranges
///
/// The report counts dropped sample and exemplar rows; `written` is left at 0.
fn drop_compressed_rows(
    batch: CopyBatch,
    samples: &[(i64, i64)],
    exemplars: &[(i64, i64)],
) -> (CopyBatch, CopyReport) {
    let mut skipped = 0u64;
    let samples = batch
        .samples
        .into_iter()
        .map(|rows| {
            let before = rows.samples.len();
            let kept: Vec<Sample> = rows
                .samples
                .into_iter()
                .filter(|s| !in_ranges(samples, s.timestamp))
                .collect();
            skipped += (before - kept.len()) as u64;
            SeriesSamples {
                series_id: rows.series_id,
                samples: kept,
            }
        })
        .collect();
    let before = batch.exemplars.len();
    let exemplars: Vec<ExemplarRow> = batch
        .exemplars
        .into_iter()
        .filter(|e| !in_ranges(exemplars, e.timestamp))
        .collect();
    let report = CopyReport {
        written: 0,
        skipped,
        exemplars_skipped: (before - exemplars.len()) as u64,
    };
    (CopyBatch { samples, exemplars }, report)
}

#[async_trait]
impl Store for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_or_create_metric(&self, name: &str) -> Result<MetricId, StoreError> {
        sqlx::query("INSERT INTO ts_catalog.metric (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        sqlx::query_scalar::<_, i64>("SELECT id FROM ts_catalog.metric WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn get_or_create_labels(&self, labels: &[Label]) -> Result<Vec<LabelId>, StoreError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        let values: Vec<&str> = labels.iter().map(|l| l.value.as_str()).collect();

        sqlx::query(
            "INSERT INTO ts_catalog.label (key, value)
             SELECT * FROM UNNEST($1::text[], $2::text[])
             ON CONFLICT (key, value) DO NOTHING",
        )
        .bind(&keys)
        .bind(&values)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT l.id
             FROM UNNEST($1::text[], $2::text[]) WITH ORDINALITY AS x(key, value, ord)
             JOIN ts_catalog.label l ON l.key = x.key AND l.value = x.value
             ORDER BY x.ord",
        )
        .bind(&keys)
        .bind(&values)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if ids.len() != labels.len() {
            return Err(StoreError::Query(format!(
                "resolved {} of {} labels",
                ids.len(),
                labels.len()
            )));
        }
        Ok(ids)
    }

    async fn lookup_labels(&self, labels: &[Label]) -> Result<Vec<Option<LabelId>>, StoreError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        let values: Vec<&str> = labels.iter().map(|l| l.value.as_str()).collect();
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT l.id
             FROM UNNEST($1::text[], $2::text[]) WITH ORDINALITY AS x(key, value, ord)
             LEFT JOIN ts_catalog.label l ON l.key = x.key AND l.value = x.value
             ORDER BY x.ord",
        )
        .bind(&keys)
        .bind(&values)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn get_or_create_series(
        &self,
        metric: MetricId,
        label_ids: &[LabelId],
    ) -> Result<SeriesId, StoreError> {
        sqlx::query(
            "INSERT INTO ts_catalog.series (metric_id, labels) VALUES ($1, $2)
             ON CONFLICT (metric_id, labels) DO NOTHING",
        )
        .bind(metric)
        .bind(label_ids)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM ts_catalog.series WHERE metric_id = $1 AND labels = $2",
        )
        .bind(metric)
        .bind(label_ids)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn get_or_create_exemplar_positions(
        &self,
        metric: &str,
        keys: &[String],
    ) -> Result<HashMap<String, usize>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Positions are dense per metric; serialize assignment for this metric only
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(metric)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let rows = sqlx::query(
            "SELECT key, pos FROM ts_catalog.exemplar_label_key_position WHERE metric_name = $1",
        )
        .bind(metric)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let mut positions = HashMap::with_capacity(rows.len() + keys.len());
        for row in &rows {
            let key: String = row.try_get("key").map_err(map_sqlx)?;
            let pos: i32 = row.try_get("pos").map_err(map_sqlx)?;
            positions.insert(key, pos.max(0) as usize);
        }

        for key in keys {
            if positions.contains_key(key) {
                continue;
            }
            let pos = positions.len();
            sqlx::query(
                "INSERT INTO ts_catalog.exemplar_label_key_position (metric_name, key, pos)
                 VALUES ($1, $2, $3)",
            )
            .bind(metric)
            .bind(key)
            .bind(pos as i32)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            positions.insert(key.clone(), pos);
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(positions)
    }

    async fn copy(
        &self,
        batch: CopyBatch,
        ignore_compressed: bool,
    ) -> Result<CopyReport, StoreError> {
        match self.copy_once(&batch).await {
            Ok(written) => Ok(CopyReport {
                written,
                ..CopyReport::default()
            }),
            Err(e) if e.is_chunk_compressed() && ignore_compressed => {
                warn!(error = %e, "copy hit a compressed chunk, retrying without compressed ranges");
                let sample_ranges = self.compressed_ranges("sample").await?;
                let exemplar_ranges = self.compressed_ranges("exemplar").await?;
                let (remaining, mut report) =
                    drop_compressed_rows(batch, &sample_ranges, &exemplar_ranges);
                if report.exemplars_skipped > 0 {
                    warn!(
                        exemplars = report.exemplars_skipped,
                        "exemplars dropped from compressed chunks"
                    );
                }
                if !remaining.is_empty() {
                    report.written = self.copy_once(&remaining).await?;
                }
                Ok(report)
            },
            Err(e) => Err(e),
        }
    }

    async fn check_writable(
        &self,
        sample_times: &[i64],
        exemplar_times: &[i64],
    ) -> Result<(), StoreError> {
        if sample_times.is_empty() && exemplar_times.is_empty() {
            return Ok(());
        }
        // chunks only exist on hypertables
        if !self.has_timescaledb().await? {
            return Ok(());
        }
        for (table, times) in [("sample", sample_times), ("exemplar", exemplar_times)] {
            if times.is_empty() {
                continue;
            }
            let ranges = self.compressed_ranges(table).await?;
            if let Some((start, end)) = ranges
                .iter()
                .find(|(start, end)| times.iter().any(|ts| ts >= start && ts < end))
            {
                return Err(StoreError::ChunkCompressed {
                    table: table.to_string(),
                    chunk: format!("[{}, {})", start, end),
                });
            }
        }
        Ok(())
    }

    async fn query_series(&self, selector: &SeriesSelector) -> Result<Vec<TimeSeries>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.labels, smp.times, smp.vals
             FROM ts_catalog.series s
             JOIN LATERAL (
                SELECT array_agg((extract(epoch FROM time) * 1000)::bigint ORDER BY time) AS times,
                       array_agg(value ORDER BY time) AS vals
                FROM ts_data.sample
                WHERE series_id = s.id
                  AND time >= to_timestamp($2::float8 / 1000.0)
                  AND time <= to_timestamp($3::float8 / 1000.0)
             ) smp ON smp.times IS NOT NULL
             WHERE s.labels @> $1::bigint[]
             ORDER BY s.id",
        )
        .bind(&selector.label_ids)
        .bind(selector.start_ms)
        .bind(selector.end_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut series = Vec::with_capacity(rows.len());
        let mut all_label_ids: Vec<i64> = Vec::new();
        for row in &rows {
            let label_ids: Vec<i64> = row.try_get("labels").map_err(map_sqlx)?;
            let times: Vec<i64> = row.try_get("times").map_err(map_sqlx)?;
            let vals: Vec<f64> = row.try_get("vals").map_err(map_sqlx)?;
            all_label_ids.extend_from_slice(&label_ids);
            let samples = times
                .into_iter()
                .zip(vals)
                .map(|(t, v)| Sample::new(t, v))
                .collect();
            series.push((label_ids, samples));
        }
        all_label_ids.sort_unstable();
        all_label_ids.dedup();

        let label_rows = sqlx::query("SELECT id, key, value FROM ts_catalog.label WHERE id = ANY($1)")
            .bind(&all_label_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut labels_by_id = HashMap::with_capacity(label_rows.len());
        for row in &label_rows {
            let id: i64 = row.try_get("id").map_err(map_sqlx)?;
            let key: String = row.try_get("key").map_err(map_sqlx)?;
            let value: String = row.try_get("value").map_err(map_sqlx)?;
            labels_by_id.insert(id, Label::new(key, value));
        }

        Ok(series
            .into_iter()
            .map(|(ids, samples)| {
                let labels = Labels::new(
                    ids.iter()
                        .filter_map(|id| labels_by_id.get(id).cloned())
                        .collect(),
                );
                TimeSeries::new(labels, samples)
            })
            .collect())
    }

    async fn insert_spans(&self, batch: &TraceBatch) -> Result<u64, StoreError> {
        let n = batch.num_spans();
        if n == 0 {
            return Ok(0);
        }
        let to_json = |v: &crate::types::Attributes| {
            serde_json::to_string(v).map_err(|e| StoreError::Query(e.to_string()))
        };

        let mut trace_ids = Vec::with_capacity(n);
        let mut span_ids = Vec::with_capacity(n);
        let mut parents = Vec::with_capacity(n);
        let mut names = Vec::with_capacity(n);
        let mut starts = Vec::with_capacity(n);
        let mut ends = Vec::with_capacity(n);
        let mut attributes = Vec::with_capacity(n);
        let mut resources = Vec::with_capacity(n);
        let mut scope_names = Vec::with_capacity(n);
        let mut scope_versions = Vec::with_capacity(n);
        for rs in &batch.resource_spans {
            let resource = to_json(&rs.resource)?;
            for span in &rs.spans {
                trace_ids.push(span.trace_id.as_str());
                span_ids.push(span.span_id.as_str());
                parents.push(span.parent_span_id.as_str());
                names.push(span.name.as_str());
                starts.push(span.start_time_unix_nano);
                ends.push(span.end_time_unix_nano);
                attributes.push(to_json(&span.attributes)?);
                resources.push(resource.clone());
                scope_names.push(rs.scope.name.as_str());
                scope_versions.push(rs.scope.version.as_str());
            }
        }

        let result = sqlx::query(
            "INSERT INTO ts_trace.span (trace_id, span_id, parent_span_id, name, start_time, end_time,
                                        attributes, resource, scope_name, scope_version)
             SELECT tid, sid, pid, nm, to_timestamp(st::float8 / 1e9), to_timestamp(et::float8 / 1e9),
                    a::jsonb, r::jsonb, sn, sv
             FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::bigint[], $6::bigint[],
                         $7::text[], $8::text[], $9::text[], $10::text[])
                  AS u(tid, sid, pid, nm, st, et, a, r, sn, sv)",
        )
        .bind(&trace_ids)
        .bind(&span_ids)
        .bind(&parents)
        .bind(&names)
        .bind(&starts)
        .bind(&ends)
        .bind(&attributes)
        .bind(&resources)
        .bind(&scope_names)
        .bind(&scope_versions)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected())
    }

    async fn database_stats(&self) -> Result<DatabaseStats, StoreError> {
        if !self.has_timescaledb().await? {
            return Ok(DatabaseStats::default());
        }
        let maintenance_jobs = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM timescaledb_information.jobs
             WHERE application_name ILIKE '%maintenance%'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let chunks_created = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM timescaledb_information.chunks
             WHERE hypertable_schema IN ('ts_data', 'ts_trace')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(DatabaseStats {
            compression_enabled: true,
            maintenance_jobs: maintenance_jobs.max(0) as u64,
            chunks_created: chunks_created.max(0) as u64,
        })
    }

    async fn series_epoch(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT current_epoch FROM ts_catalog.ids_epoch LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map(|epoch| epoch.unwrap_or(0))
            .map_err(map_sqlx)
    }

    async fn supports_telemetry(&self) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT to_regclass('ts_catalog.telemetry') IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn write_telemetry(&self, report: &TelemetryReport) -> Result<(), StoreError> {
        let body = serde_json::to_string(report).map_err(|e| StoreError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO ts_catalog.telemetry (instance_id, report, updated_at)
             VALUES ($1::uuid, $2::jsonb, now())
             ON CONFLICT (instance_id) DO UPDATE SET report = EXCLUDED.report, updated_at = now()",
        )
        .bind(report.instance_id.to_string())
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_malformed_connection_string_is_configuration_error() {
        let db = DatabaseConfig::default().with_url("definitely not a url ::");
        match PgStore::connect(&db, 1, None).await {
            Err(Error::Configuration(msg)) => assert!(!msg.contains("definitely")),
            Err(other) => panic!("expected configuration error, got {other}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[tokio::test]
    async fn test_bad_bounds_are_configuration_error() {
        let db = DatabaseConfig::default().with_pool_bounds(4, 2);
        assert!(matches!(
            PgStore::connect(&db, 1, None).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_server_hits_connect_timeout() {
        // accepts TCP but never answers the startup message
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let db = DatabaseConfig {
            connect_timeout_secs: 1,
            ..DatabaseConfig::default()
                .with_url(format!("postgres://promstore:secret@{}/promstore", addr))
                .with_pool_bounds(1, 1)
        };
        match PgStore::connect(&db, 1, None).await {
            Err(Error::Connect(msg)) => assert!(!msg.contains("secret")),
            Err(other) => panic!("expected connect error, got {other}"),
            Ok(_) => panic!("expected connect error"),
        }
    }

    #[test]
    fn test_drop_compressed_rows() {
        let batch = CopyBatch {
            samples: vec![SeriesSamples {
                series_id: 1,
                samples: vec![Sample::new(5, 1.0), Sample::new(15, 2.0), Sample::new(25, 3.0)],
            }],
            exemplars: vec![ExemplarRow {
                series_id: 1,
                timestamp: 12,
                value: 1.0,
                label_values: vec![Some("abc".into())],
            }],
        };
        let (remaining, report) = drop_compressed_rows(batch, &[(10, 20)], &[(10, 20)]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.exemplars_skipped, 1);
        assert_eq!(remaining.num_samples(), 2);
        assert!(remaining.exemplars.is_empty());
    }

    #[test]
    fn test_pool_timeout_maps_to_store_error() {
        assert!(matches!(map_sqlx(sqlx::Error::PoolTimedOut), StoreError::PoolTimeout));
        assert!(matches!(map_sqlx(sqlx::Error::PoolClosed), StoreError::Closed));
    }
}
