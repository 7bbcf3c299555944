//! PostgreSQL host functions.
//!
//! Handlers run on plain OS threads, so the executor owns a tokio runtime and
//! blocks on each statement. Calls made from inside another tokio runtime are
//! refused with [`MatchError::Database`].
//!
//! Enable with the `postgres` feature flag.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};
use tokio::runtime::Runtime;
use tracing::error;

use crate::config::SqlConfig;
use crate::error::{MatchError, Result};
use crate::runtime::retry::{retry, RetryPolicy};

/// Serialization failure and deadlock detected.
const RETRYABLE_CODES: [&str; 2] = ["40001", "40P01"];

/// Blocking SQL executor shared by every handler on the node.
pub struct SqlExecutor {
    pool: PgPool,
    runtime: Arc<Runtime>,
    policy: RetryPolicy,
}

impl SqlExecutor {
    /// Connect using `config.database_url`.
    ///
    /// This creates a new tokio runtime internally.
    pub fn connect(config: &SqlConfig) -> Result<Self> {
        if config.database_url.is_empty() {
            return Err(MatchError::configuration("sql.database_url is empty"));
        }
        ensure_blocking_context()?;
        let runtime = Runtime::new()?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.database_url),
            )
            .map_err(|e| MatchError::Database(e.to_string()))?;
        Ok(Self::with_pool(pool, runtime, RetryPolicy::from(config)))
    }

    /// Create with an existing pool.
    pub fn with_pool(pool: PgPool, runtime: Runtime, policy: RetryPolicy) -> Self {
        Self {
            pool,
            runtime: Arc::new(runtime),
            policy,
        }
    }

    /// Run a statement, returning `{rows_affected}`.
    pub fn exec(&self, query: &str, params: &Value) -> Result<Value> {
        ensure_blocking_context()?;
        let params = params_array(params)?;
        let outcome = self.runtime.block_on(retry(&self.policy, is_transient, || {
            bind_params(sqlx::query(query), params).execute(&self.pool)
        }));

        match outcome {
            Ok(done) => Ok(json!({ "rows_affected": done.rows_affected() })),
            Err(e) => {
                error!(query, error = %e, "failed to exec db query");
                Err(MatchError::Database(format!("failed to exec db query: {}", e)))
            }
        }
    }

    /// Run a query, returning one object per row keyed by column name.
    pub fn query(&self, query: &str, params: &Value) -> Result<Vec<Value>> {
        ensure_blocking_context()?;
        let params = params_array(params)?;
        let outcome = self.runtime.block_on(retry(&self.policy, is_transient, || {
            bind_params(sqlx::query(query), params).fetch_all(&self.pool)
        }));

        match outcome {
            Ok(rows) => Ok(rows.iter().map(row_to_json).collect()),
            Err(e) => {
                error!(query, error = %e, "failed to exec db query");
                Err(MatchError::Database(format!("failed to exec db query: {}", e)))
            }
        }
    }
}

/// `block_on` panics when the current thread already drives a runtime.
fn ensure_blocking_context() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(MatchError::Database(
            "sql executor cannot be called from inside an async runtime".into(),
        ));
    }
    Ok(())
}

fn params_array(params: &Value) -> Result<&[Value]> {
    match params {
        Value::Null => Ok(&[]),
        Value::Array(items) => Ok(items.as_slice()),
        _ => Err(MatchError::protocol("Invalid argument - query params must be an array.")),
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| RETRYABLE_CODES.iter().any(|c| *c == code))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), column_value(row, i, column.type_info().name()));
    }
    Value::Object(map)
}

fn column_value(row: &PgRow, i: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(i).map(|v| json!(v)),
        "INT2" => row.try_get::<Option<i16>, _>(i).map(|v| json!(v)),
        "INT4" => row.try_get::<Option<i32>, _>(i).map(|v| json!(v)),
        "INT8" => row.try_get::<Option<i64>, _>(i).map(|v| json!(v)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(i).map(|v| json!(v)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i).map(|v| json!(v)),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).map(|v| v.unwrap_or(Value::Null)),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(i)
            .map(|v| json!(v.map(|u| u.to_string()))),
        _ => row.try_get::<Option<String>, _>(i).map(|v| json!(v)),
    };
    decoded.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_must_be_array() {
        assert!(params_array(&Value::Null).unwrap().is_empty());
        assert_eq!(params_array(&json!([1, "a"])).unwrap().len(), 2);

        let err = params_array(&json!({"a": 1})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol violation: Invalid argument - query params must be an array."
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_connect_requires_url() {
        let err = SqlExecutor::connect(&SqlConfig::default()).err();
        assert!(matches!(err, Some(MatchError::Configuration(_))));
    }

    #[test]
    fn test_plain_thread_may_block() {
        assert!(ensure_blocking_context().is_ok());
    }

    #[tokio::test]
    async fn test_calls_inside_runtime_refused() {
        assert!(matches!(ensure_blocking_context(), Err(MatchError::Database(_))));

        let config = SqlConfig {
            database_url: "postgres://localhost/kaos".into(),
            ..SqlConfig::default()
        };
        let err = SqlExecutor::connect(&config).err();
        assert!(matches!(err, Some(MatchError::Database(ref m)) if m.contains("async runtime")));
    }
}
