//! DuckDB engine adapter.
//!
//! Binds the [`Engine`](crate::engine::Engine) contract to an embedded
//! DuckDB connection. Catalog reads go through `information_schema.columns`
//! and `duckdb_constraints()`; query schemas come from the Arrow schema of
//! the prepared statement. Every statement is logged at DEBUG before it is
//! executed.
//!
//! Lakehouse `merge` is not provided here: DuckDB's delta extension is
//! read-only, which is enough for the `delta_scan` key-start reads the
//! lakehouse loader issues, but not for writes.

use chrono::{DateTime, Duration, NaiveDate};
use duckdb::arrow::datatypes::DataType;
use duckdb::types::{TimeUnit, Value};
use duckdb::{params_from_iter, Connection};
use tracing::debug;

use crate::engine::{Engine, SqlValue};
use crate::error::DuckFlowError;
use crate::schema::{Column, LogicalType, TableSchema};

/// [`Engine`] implementation over an embedded DuckDB connection.
pub struct DuckDbEngine {
    conn: Connection,
}

impl DuckDbEngine {
    /// Open a transient in-memory database.
    pub fn open_in_memory() -> Result<Self, DuckFlowError> {
        Ok(DuckDbEngine {
            conn: Connection::open_in_memory().map_err(engine_err)?,
        })
    }

    /// Open (or create) a database file.
    pub fn open(path: &str) -> Result<Self, DuckFlowError> {
        Ok(DuckDbEngine {
            conn: Connection::open(path).map_err(engine_err)?,
        })
    }

    /// Wrap an existing connection.
    pub fn new(conn: Connection) -> Self {
        DuckDbEngine { conn }
    }

    /// Access the underlying connection, e.g. to manage transactions.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn engine_err(e: duckdb::Error) -> DuckFlowError {
    DuckFlowError::Engine(e.to_string())
}

fn to_duckdb(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(v) => Value::Boolean(*v),
        SqlValue::Int(v) => Value::BigInt(*v),
        SqlValue::Float(v) => Value::Double(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
        SqlValue::Timestamp(ts) => {
            Value::Timestamp(TimeUnit::Microsecond, ts.and_utc().timestamp_micros())
        }
    }
}

fn from_duckdb(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(v) => SqlValue::Bool(v),
        Value::TinyInt(v) => SqlValue::Int(v as i64),
        Value::SmallInt(v) => SqlValue::Int(v as i64),
        Value::Int(v) => SqlValue::Int(v as i64),
        Value::BigInt(v) => SqlValue::Int(v),
        Value::HugeInt(v) => SqlValue::Int(v as i64),
        Value::UTinyInt(v) => SqlValue::Int(v as i64),
        Value::USmallInt(v) => SqlValue::Int(v as i64),
        Value::UInt(v) => SqlValue::Int(v as i64),
        Value::UBigInt(v) => SqlValue::Int(v as i64),
        Value::Float(v) => SqlValue::Float(v as f64),
        Value::Double(v) => SqlValue::Float(v),
        Value::Text(v) => SqlValue::Text(v),
        Value::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            match DateTime::from_timestamp_micros(micros) {
                Some(ts) => SqlValue::Timestamp(ts.naive_utc()),
                None => SqlValue::Null,
            }
        }
        Value::Date32(days) => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date");
            match epoch.checked_add_signed(Duration::days(days as i64)) {
                Some(date) => SqlValue::Timestamp(date.and_hms_opt(0, 0, 0).expect("midnight")),
                None => SqlValue::Null,
            }
        }
        // Decimals, blobs and nested types cross the boundary as their
        // debug rendering; the core only computes on the variants above.
        other => SqlValue::Text(format!("{other:?}")),
    }
}

fn logical_type(dt: &DataType) -> LogicalType {
    match dt {
        DataType::Boolean => LogicalType::Boolean,
        DataType::Int8 | DataType::Int16 | DataType::Int32 => LogicalType::Integer,
        DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => LogicalType::BigInt,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => LogicalType::Double,
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => {
            LogicalType::Decimal(*p, (*s).max(0) as u8)
        }
        DataType::Utf8 | DataType::LargeUtf8 => LogicalType::Varchar(None),
        DataType::Date32 | DataType::Date64 => LogicalType::Date,
        DataType::Timestamp(_, _) => LogicalType::Timestamp,
        _ => LogicalType::Varchar(None),
    }
}

impl Engine for DuckDbEngine {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<(), DuckFlowError> {
        debug!(sql, "execute");
        let mut stmt = self.conn.prepare(sql).map_err(engine_err)?;
        stmt.execute(params_from_iter(params.iter().map(to_duckdb)))
            .map_err(engine_err)?;
        Ok(())
    }

    fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, DuckFlowError> {
        debug!(sql, "fetch");
        let mut stmt = self.conn.prepare(sql).map_err(engine_err)?;
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_duckdb)))
            .map_err(engine_err)?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(engine_err)? {
            let count = row.as_ref().column_count();
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                let value: Value = row.get(i).map_err(engine_err)?;
                values.push(from_duckdb(value));
            }
            result.push(values);
        }
        Ok(result)
    }

    fn query_schema(&self, sql: &str) -> Result<TableSchema, DuckFlowError> {
        debug!(sql, "query schema");
        let mut stmt = self.conn.prepare(sql).map_err(engine_err)?;
        {
            let _rows = stmt.query_arrow([]).map_err(engine_err)?;
        }
        let schema = stmt.schema();
        let mut result = TableSchema::new();
        for field in schema.fields() {
            let mut column = Column::new(field.name().clone(), logical_type(field.data_type()));
            column.nullable = field.is_nullable();
            result.add_column(column)?;
        }
        Ok(result)
    }

    fn catalog_columns(&self, table: &str) -> Result<Vec<Column>, DuckFlowError> {
        let rows = self.fetch(
            "select column_name, data_type, is_nullable, numeric_precision, numeric_scale \
             from information_schema.columns where table_name = $1 order by ordinal_position",
            &[SqlValue::Text(table.to_string())],
        )?;
        if rows.is_empty() {
            return Err(DuckFlowError::Engine(format!(
                "table '{table}' not found in the catalog"
            )));
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| DuckFlowError::Engine("catalog row without a name".into()))?
                .to_string();
            let type_text = row.get(1).and_then(|v| v.as_str()).unwrap_or("VARCHAR");
            let nullable = row
                .get(2)
                .and_then(|v| v.as_str())
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(true);
            let precision = row.get(3).and_then(|v| v.as_i64()).map(|v| v as u8);
            let scale = row.get(4).and_then(|v| v.as_i64()).map(|v| v as u8);
            let mut column = Column::new(name, LogicalType::parse(type_text, precision, scale));
            column.nullable = nullable;
            columns.push(column);
        }
        Ok(columns)
    }

    fn primary_key(&self, table: &str) -> Result<Option<Vec<String>>, DuckFlowError> {
        let rows = self.fetch(
            "select unnest(constraint_column_names) from duckdb_constraints() \
             where table_name = $1 and constraint_type = 'PRIMARY KEY'",
            &[SqlValue::Text(table.to_string())],
        )?;
        let pks: Vec<String> = rows
            .iter()
            .filter_map(|r| r.first().and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        if pks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pks))
        }
    }
}
