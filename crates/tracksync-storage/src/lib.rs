//! PostgreSQL upsert store for normalized relations.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::postgres::{types::PgInterval, PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracksync_core::{format_iso8601_duration, ColumnDef, FieldType, Record, Value};
use tracksync_normalize::NormalizedBatch;

mod table;

pub use table::{
    prepare_rows, qualify, quote_ident, ForeignKey, PreparedWrite, RowGroup, TableDef, TableKind,
    MAX_BIND_PARAMS,
};

pub const CRATE_NAME: &str = "tracksync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("{relation}: unknown column `{column}`")]
    UnknownColumn { relation: String, column: String },
    #[error("{relation}: record {index} has no value for key column `{column}`")]
    MissingKey {
        relation: String,
        column: String,
        index: usize,
    },
    #[error("{relation}.{column}: expected {expected:?}, found {found}")]
    TypeMismatch {
        relation: String,
        column: String,
        expected: FieldType,
        found: &'static str,
    },
    #[error("{relation}: no row with id `{id}`")]
    NotFound { relation: String, id: String },
    #[error("database connection failed")]
    Connection(#[source] sqlx::Error),
    #[error("{relation}: constraint violated")]
    Constraint {
        relation: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{relation}: query failed")]
    Query {
        relation: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    fn from_sqlx(relation: &str, err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match &err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Constraint {
                    relation: relation.to_string(),
                    source: err,
                },
                _ => StoreError::Query {
                    relation: relation.to_string(),
                    source: err,
                },
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err),
            _ => StoreError::Query {
                relation: relation.to_string(),
                source: err,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Nothing to write; no statement was sent.
    NoOp,
    /// At least one row was inserted or updated.
    Written,
    /// Committed, but every row already existed and nothing changed.
    Unchanged,
}

/// Outcome of one relation inside a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationWrite {
    pub relation: String,
    pub records: usize,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns the connection pool and every table definition of the catalog.
#[derive(Debug, Clone)]
pub struct UpsertStore {
    pool: PgPool,
    tables: BTreeMap<&'static str, TableDef>,
}

impl UpsertStore {
    #[tracing::instrument(level = "debug", skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let tables = TableDef::catalog()
            .into_iter()
            .map(|t| (t.relation, t))
            .collect();
        Self { pool, tables }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub fn table(&self, relation: &str) -> Result<&TableDef, StoreError> {
        self.tables
            .get(relation)
            .ok_or_else(|| StoreError::UnknownTable(relation.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Create both source schemas and every table if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::Connection)?;

        for schema in [tracksync_core::Source::Clockify, tracksync_core::Source::Linear] {
            let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema.as_str()));
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx(schema.as_str(), e))?;
        }

        // entity tables precede junctions so foreign keys resolve
        for table in TableDef::catalog() {
            sqlx::query(&table.create_sql())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx(table.relation, e))?;
            debug!(relation = table.relation, "table ensured");
        }

        tx.commit().await.map_err(|e| StoreError::from_sqlx("migrate", e))?;
        info!(tables = self.tables.len(), "schema migrated");
        Ok(())
    }

    /// Upsert `records` into `relation` in one transaction.
    #[tracing::instrument(level = "debug", skip(self, records), fields(records = records.len()))]
    pub async fn write(&self, relation: &str, records: &[Record]) -> Result<WriteOutcome, StoreError> {
        if records.is_empty() {
            return Ok(WriteOutcome::NoOp);
        }
        let table = self.table(relation)?;
        let prepared = prepare_rows(table, records)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(relation, e))?;

        let mut affected = 0u64;
        for group in &prepared.groups {
            for chunk in group.rows.chunks(group.rows_per_statement()) {
                let sql = table.upsert_sql(&group.columns, chunk.len());
                let mut query = sqlx::query(&sql);
                for row in chunk {
                    for (column, value) in group.columns.iter().zip(row) {
                        query = bind_value(query, relation, column, value);
                    }
                }
                let result = query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::from_sqlx(relation, e))?;
                affected += result.rows_affected();
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(relation, e))?;

        let outcome = if affected > 0 {
            WriteOutcome::Written
        } else {
            WriteOutcome::Unchanged
        };
        info!(relation, rows = prepared.row_count(), affected, ?outcome, "upsert committed");
        Ok(outcome)
    }

    /// Write the primary relation, then each derived relation, each in its own transaction.
    pub async fn write_batch(&self, batch: &NormalizedBatch) -> Result<Vec<RelationWrite>, StoreError> {
        let mut outcomes = Vec::with_capacity(1 + batch.derived.len());
        for relation in batch.relations() {
            let outcome = self.write(&relation.name, &relation.records).await?;
            outcomes.push(RelationWrite {
                relation: relation.name.clone(),
                records: relation.len(),
                outcome,
            });
        }
        Ok(outcomes)
    }

    /// Every row of `relation`, ordered by key.
    pub async fn fetch_all(&self, relation: &str) -> Result<Vec<Record>, StoreError> {
        let table = self.table(relation)?;
        let rows = sqlx::query(&table.select_all_sql())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(relation, e))?;
        rows.iter()
            .map(|row| decode_row(table, row).map_err(|e| StoreError::from_sqlx(relation, e)))
            .collect()
    }

    pub async fn fetch_by_id(&self, relation: &str, id: &str) -> Result<Record, StoreError> {
        let table = self.table(relation)?;
        if table.column("id").is_none() {
            return Err(StoreError::UnknownColumn {
                relation: relation.to_string(),
                column: "id".to_string(),
            });
        }
        let row = sqlx::query(&table.select_by_id_sql())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(relation, e))?
            .ok_or_else(|| StoreError::NotFound {
                relation: relation.to_string(),
                id: id.to_string(),
            })?;
        decode_row(table, &row).map_err(|e| StoreError::from_sqlx(relation, e))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    relation: &str,
    column: &ColumnDef,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match (column.field_type, value) {
        (FieldType::Boolean, Value::Bool(b)) => query.bind(*b),
        (FieldType::Boolean, _) => query.bind(None::<bool>),
        (FieldType::Integer, Value::Integer(i)) => query.bind(*i),
        (FieldType::Integer, _) => query.bind(None::<i64>),
        (FieldType::Float, Value::Float(x)) => query.bind(*x),
        (FieldType::Float, Value::Integer(i)) => query.bind(*i as f64),
        (FieldType::Float, _) => query.bind(None::<f64>),
        (FieldType::Timestamp, Value::Timestamp(ts)) => query.bind(*ts),
        (FieldType::Timestamp, _) => query.bind(None::<NaiveDateTime>),
        (FieldType::Duration, Value::Duration(d)) => query.bind(interval_micros(relation, column, *d)),
        (FieldType::Duration, _) => query.bind(None::<chrono::Duration>),
        (_, Value::Text(s)) => query.bind(s.clone()),
        _ => query.bind(None::<String>),
    }
}

/// INTERVAL has microsecond resolution; spans beyond `i64` microseconds are stored as null.
fn interval_micros(relation: &str, column: &ColumnDef, duration: chrono::Duration) -> Option<chrono::Duration> {
    let micros = duration.num_microseconds();
    if micros.is_none() {
        warn!(
            relation,
            column = column.name,
            duration = %format_iso8601_duration(duration),
            "duration overflows INTERVAL, storing null"
        );
    }
    micros.map(chrono::Duration::microseconds)
}

fn decode_row(table: &TableDef, row: &PgRow) -> Result<Record, sqlx::Error> {
    let mut record = Record::with_capacity(table.columns.len());
    for column in &table.columns {
        let name = column.name;
        let value = match column.field_type {
            FieldType::Identifier | FieldType::Text | FieldType::StringList => {
                Value::from(row.try_get::<Option<String>, _>(name)?)
            }
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(name)?
                .map_or(Value::Null, Value::Bool),
            FieldType::Integer => row
                .try_get::<Option<i64>, _>(name)?
                .map_or(Value::Null, Value::Integer),
            FieldType::Float => row
                .try_get::<Option<f64>, _>(name)?
                .map_or(Value::Null, Value::Float),
            FieldType::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(name)?
                .map_or(Value::Null, Value::Timestamp),
            FieldType::Duration => row
                .try_get::<Option<PgInterval>, _>(name)?
                .map_or(Value::Null, |iv| Value::Duration(interval_to_duration(&iv))),
        };
        record.insert(name, value);
    }
    Ok(record)
}

/// Months have no fixed length; they are read back as 30 days.
fn interval_to_duration(interval: &PgInterval) -> chrono::Duration {
    chrono::Duration::days(i64::from(interval.months) * 30 + i64::from(interval.days))
        + chrono::Duration::microseconds(interval.microseconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_read_back_as_exact_durations() {
        let interval = PgInterval {
            months: 0,
            days: 1,
            microseconds: 5_400_000_000,
        };
        assert_eq!(
            interval_to_duration(&interval),
            chrono::Duration::hours(24) + chrono::Duration::minutes(90)
        );
        let month = PgInterval {
            months: 1,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(interval_to_duration(&month), chrono::Duration::days(30));
    }

    #[test]
    fn overflowing_durations_bind_as_null() {
        let column = ColumnDef {
            name: "duration",
            field_type: FieldType::Duration,
        };
        assert_eq!(
            interval_micros("clockify.tasks", &column, chrono::Duration::minutes(90)),
            Some(chrono::Duration::minutes(90))
        );
        assert_eq!(
            interval_micros("clockify.tasks", &column, chrono::Duration::nanoseconds(1_500)),
            Some(chrono::Duration::microseconds(1))
        );
        assert_eq!(
            interval_micros("clockify.tasks", &column, chrono::Duration::MAX),
            None
        );
    }

    #[test]
    fn store_errors_name_the_relation() {
        let err = StoreError::TypeMismatch {
            relation: "clockify.projects".into(),
            column: "hourly_rate_amount".into(),
            expected: FieldType::Float,
            found: "text",
        };
        assert_eq!(
            err.to_string(),
            "clockify.projects.hourly_rate_amount: expected Float, found text"
        );
        let err = StoreError::from_sqlx("linear.users", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Connection(_)));
        let err = StoreError::from_sqlx("linear.users", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query { .. }));
    }

    #[test]
    fn catalog_tables_are_registered_by_relation_name() {
        let tables: BTreeMap<_, _> = TableDef::catalog()
            .into_iter()
            .map(|t| (t.relation, t.kind))
            .collect();
        assert_eq!(tables.get("linear.issues"), Some(&TableKind::Entity));
        assert_eq!(tables.get("linear.cycle_issues"), Some(&TableKind::Junction));
        assert_eq!(tables.get("clockify.project_memberships"), Some(&TableKind::Junction));
        assert_eq!(tables.len(), 11 + 4);
    }
}
