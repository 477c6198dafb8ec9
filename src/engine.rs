//! The engine adapter contract.
//!
//! The embedded OLAP engine sits below the SQL layer and is an external
//! collaborator accessed through this narrow interface: execute a statement
//! with positional parameters, fetch rows, report the schema of an
//! arbitrary query, read the table/column catalog, and maintain monotonic
//! sequences. Lakehouse targets additionally need a `merge` implementation;
//! engines without one inherit the default, which refuses.
//!
//! Parameters are always bound positionally (`$1`, `$2`, ...); generated
//! SQL never inlines user-provided values as literals.

use std::fmt;

use chrono::NaiveDateTime;

use crate::error::DuckFlowError;
use crate::schema::{Column, TableSchema};
use crate::sql;

#[cfg(feature = "duckdb")]
pub mod duckdb;

/// A value crossing the adapter boundary, either as a bound parameter or a
/// fetched cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "null"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "{v}"),
            SqlValue::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// Assignment list of a merge clause: `(target column, source expression)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeAssignments {
    pub assignments: Vec<(String, String)>,
    /// Extra predicate on the clause (e.g. `s."__change_type" = 'U'`).
    pub predicate: Option<String>,
}

/// Merge request handed to a lakehouse-capable engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSpec {
    /// Query producing the source rows (aliased `s` in the predicates).
    pub source_sql: String,
    /// Join predicate between source `s` and target `t`.
    pub predicate: String,
    /// `WHEN MATCHED AND <predicate> THEN DELETE`.
    pub matched_delete: Option<String>,
    /// `WHEN MATCHED [AND <predicate>] THEN UPDATE SET …`.
    pub matched_update: Option<MergeAssignments>,
    /// `WHEN NOT MATCHED [AND <predicate>] THEN INSERT …`.
    pub not_matched_insert: Option<MergeAssignments>,
}

/// Operation against a lakehouse table.
#[derive(Debug, Clone, PartialEq)]
pub enum LakehouseOp {
    Merge(MergeSpec),
    Append { source_sql: String },
}

/// Narrow contract over the embedded OLAP engine.
pub trait Engine {
    /// Run a statement; positional parameters bound by index (`$1`, ...).
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<(), DuckFlowError>;

    /// Run a query and return all rows.
    fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, DuckFlowError>;

    /// Schema of an arbitrary query, derived from its Arrow schema.
    fn query_schema(&self, sql: &str) -> Result<TableSchema, DuckFlowError>;

    /// Ordered column definitions of a persisted table, with nullability
    /// and decimal precision/scale.
    fn catalog_columns(&self, table: &str) -> Result<Vec<Column>, DuckFlowError>;

    /// Primary key columns of a persisted table, `None` when it has none.
    fn primary_key(&self, table: &str) -> Result<Option<Vec<String>>, DuckFlowError>;

    /// Create (or replace) a monotonic sequence starting at `start`.
    fn create_sequence(&self, name: &str, start: i64) -> Result<(), DuckFlowError> {
        self.execute(
            &format!(
                "create or replace sequence {} start {start}",
                sql::quote_ident(name)
            ),
            &[],
        )
    }

    /// Next value of a sequence.
    fn nextval(&self, name: &str) -> Result<i64, DuckFlowError> {
        let rows = self.fetch(&format!("select {}", sql::nextval(name)), &[])?;
        rows.first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                DuckFlowError::Engine(format!("sequence '{name}' returned no value"))
            })
    }

    /// Apply a [`LakehouseOp`] to an external table, returning the number
    /// of source rows. Only lakehouse-capable engines implement this.
    fn merge(&self, target: &str, op: &LakehouseOp) -> Result<u64, DuckFlowError> {
        let _ = op;
        Err(DuckFlowError::Unsupported(format!(
            "merge into '{target}' - this engine has no lakehouse support"
        )))
    }
}

/// Fetch a single count.
pub(crate) fn fetch_count(
    engine: &dyn Engine,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, DuckFlowError> {
    let rows = engine.fetch(sql, params)?;
    let value = rows
        .first()
        .and_then(|r| r.first())
        .ok_or_else(|| DuckFlowError::Engine(format!("count query returned no rows: {sql}")))?;
    Ok(value.as_i64().unwrap_or(0).max(0) as u64)
}

/// Fetch an optional scalar (e.g. `max(key)`); `None` for NULL or no rows.
pub(crate) fn fetch_optional_i64(
    engine: &dyn Engine,
    sql: &str,
) -> Result<Option<i64>, DuckFlowError> {
    let rows = engine.fetch(sql, &[])?;
    Ok(rows.first().and_then(|r| r.first()).and_then(|v| v.as_i64()))
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted engine for unit tests.
    //!
    //! Records every statement it is handed and serves canned responses:
    //! catalogs and primary keys keyed by table name, fetch results and
    //! query schemas as FIFO scripts. An exhausted fetch script yields a
    //! single `0` cell, which satisfies the trailing `count(*)` every step
    //! issues.

    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Execute { sql: String, params: Vec<SqlValue> },
        Fetch { sql: String, params: Vec<SqlValue> },
        Merge { target: String, op: LakehouseOp },
    }

    #[derive(Default)]
    pub(crate) struct MockEngine {
        pub calls: RefCell<Vec<Call>>,
        fetch_script: RefCell<VecDeque<Vec<Vec<SqlValue>>>>,
        schema_script: RefCell<VecDeque<TableSchema>>,
        catalog: RefCell<HashMap<String, Vec<Column>>>,
        pks: RefCell<HashMap<String, Vec<String>>>,
        merge_rows: Cell<u64>,
        fail_on: RefCell<Option<String>>,
    }

    impl MockEngine {
        pub fn new() -> Self {
            MockEngine::default()
        }

        /// Register a table in the mock catalog.
        pub fn add_table(&self, name: &str, columns: Vec<Column>, pk: &[&str]) {
            self.catalog.borrow_mut().insert(name.to_string(), columns);
            if !pk.is_empty() {
                self.pks
                    .borrow_mut()
                    .insert(name.to_string(), pk.iter().map(|p| p.to_string()).collect());
            }
        }

        pub fn push_fetch(&self, rows: Vec<Vec<SqlValue>>) {
            self.fetch_script.borrow_mut().push_back(rows);
        }

        pub fn push_schema(&self, schema: TableSchema) {
            self.schema_script.borrow_mut().push_back(schema);
        }

        pub fn set_merge_rows(&self, rows: u64) {
            self.merge_rows.set(rows);
        }

        /// Fail any execute whose SQL contains `pattern`.
        pub fn fail_on(&self, pattern: &str) {
            *self.fail_on.borrow_mut() = Some(pattern.to_string());
        }

        /// All executed statements, in order.
        pub fn executed(&self) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|c| match c {
                    Call::Execute { sql, .. } => Some(sql.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Parameters of the `n`-th executed statement.
        pub fn executed_params(&self, n: usize) -> Vec<SqlValue> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|c| match c {
                    Call::Execute { params, .. } => Some(params.clone()),
                    _ => None,
                })
                .nth(n)
                .unwrap_or_default()
        }

        pub fn merges(&self) -> Vec<(String, LakehouseOp)> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|c| match c {
                    Call::Merge { target, op } => Some((target.clone(), op.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    impl Engine for MockEngine {
        fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<(), DuckFlowError> {
            if let Some(pattern) = self.fail_on.borrow().as_deref() {
                if sql.contains(pattern) {
                    return Err(DuckFlowError::Engine(format!("scripted failure: {pattern}")));
                }
            }
            self.calls.borrow_mut().push(Call::Execute {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            Ok(())
        }

        fn fetch(
            &self,
            sql: &str,
            params: &[SqlValue],
        ) -> Result<Vec<Vec<SqlValue>>, DuckFlowError> {
            self.calls.borrow_mut().push(Call::Fetch {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            Ok(self
                .fetch_script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| vec![vec![SqlValue::Int(0)]]))
        }

        fn query_schema(&self, sql: &str) -> Result<TableSchema, DuckFlowError> {
            self.schema_script
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| DuckFlowError::Engine(format!("no scripted schema for: {sql}")))
        }

        fn catalog_columns(&self, table: &str) -> Result<Vec<Column>, DuckFlowError> {
            self.catalog
                .borrow()
                .get(table)
                .cloned()
                .ok_or_else(|| DuckFlowError::Engine(format!("unknown table: {table}")))
        }

        fn primary_key(&self, table: &str) -> Result<Option<Vec<String>>, DuckFlowError> {
            Ok(self.pks.borrow().get(table).cloned())
        }

        fn merge(&self, target: &str, op: &LakehouseOp) -> Result<u64, DuckFlowError> {
            self.calls.borrow_mut().push(Call::Merge {
                target: target.to_string(),
                op: op.clone(),
            });
            Ok(self.merge_rows.get())
        }
    }
}
