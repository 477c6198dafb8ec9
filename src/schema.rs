//! Logical column types and table schemas.
//!
//! Datasets describe their shape as a mapping of column name to
//! [`LogicalType`]. The engine adapter populates schemas from the catalog
//! (preserving nullability and decimal precision/scale) or from the Arrow
//! schema of an arbitrary query; steps accumulate schemas for tables they
//! create. Column order is preserved everywhere so generated SQL is
//! deterministic.

use indexmap::IndexMap;
use itertools::Itertools;

use crate::error::DuckFlowError;
use crate::sql::quote_ident;

/// Logical column type, engine-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalType {
    Boolean,
    Integer,
    BigInt,
    Double,
    /// Precision and scale.
    Decimal(u8, u8),
    /// Optional length limit.
    Varchar(Option<u32>),
    Date,
    Timestamp,
}

impl LogicalType {
    /// Render the SQL type name.
    pub fn sql_type(&self) -> String {
        match self {
            LogicalType::Boolean => "boolean".to_string(),
            LogicalType::Integer => "integer".to_string(),
            LogicalType::BigInt => "bigint".to_string(),
            LogicalType::Double => "double".to_string(),
            LogicalType::Decimal(p, s) => format!("decimal({p},{s})"),
            LogicalType::Varchar(None) => "varchar".to_string(),
            LogicalType::Varchar(Some(n)) => format!("varchar({n})"),
            LogicalType::Date => "date".to_string(),
            LogicalType::Timestamp => "timestamp".to_string(),
        }
    }

    /// Map an engine-reported type name to a logical type.
    ///
    /// `precision`/`scale` come from the catalog when available and win over
    /// any parenthesised arguments in the type text. A generic `NUMBER` or
    /// `DECIMAL` without precision maps to `decimal(38,7)`. Unknown types
    /// fall back to `varchar` so foreign catalogs cannot abort a run.
    pub fn parse(text: &str, precision: Option<u8>, scale: Option<u8>) -> Self {
        let upper = text.trim().to_uppercase();
        let (base, args) = match upper.split_once('(') {
            Some((b, rest)) => (
                b.trim().to_string(),
                rest.trim_end_matches(')')
                    .split(',')
                    .filter_map(|a| a.trim().parse::<u32>().ok())
                    .collect::<Vec<_>>(),
            ),
            None => (upper.clone(), Vec::new()),
        };
        match base.as_str() {
            "BOOLEAN" | "BOOL" => LogicalType::Boolean,
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "INT4" => LogicalType::Integer,
            "BIGINT" | "INT8" | "HUGEINT" | "UINTEGER" | "UBIGINT" => LogicalType::BigInt,
            "FLOAT" | "REAL" | "DOUBLE" => LogicalType::Double,
            "DECIMAL" | "NUMERIC" | "NUMBER" => {
                let p = precision.or_else(|| args.first().map(|v| *v as u8));
                let s = scale.or_else(|| args.get(1).map(|v| *v as u8));
                match (p, s) {
                    (Some(p), Some(s)) => LogicalType::Decimal(p, s),
                    (Some(p), None) => LogicalType::Decimal(p, 0),
                    _ => LogicalType::Decimal(38, 7),
                }
            }
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" => {
                LogicalType::Varchar(args.first().copied())
            }
            "DATE" => LogicalType::Date,
            t if t.starts_with("TIMESTAMP") => LogicalType::Timestamp,
            _ => LogicalType::Varchar(None),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl Column {
    /// A nullable column.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Column {
            name: name.into(),
            logical_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered column collection describing a dataset's shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: IndexMap<String, Column>,
}

impl TableSchema {
    pub fn new() -> Self {
        TableSchema::default()
    }

    pub fn from_columns(cols: impl IntoIterator<Item = Column>) -> Self {
        let mut schema = TableSchema::new();
        for col in cols {
            // Last writer wins; catalogs never report duplicates.
            schema.columns.insert(col.name.clone(), col);
        }
        schema
    }

    /// Append a column; duplicates are a schema error.
    pub fn add_column(&mut self, col: Column) -> Result<(), DuckFlowError> {
        if self.columns.contains_key(&col.name) {
            return Err(DuckFlowError::Schema(format!(
                "column '{}' already exists",
                col.name
            )));
        }
        self.columns.insert(col.name.clone(), col);
        Ok(())
    }

    /// Append every column of `other` that is not present yet.
    pub fn merge(&mut self, other: &TableSchema) {
        for col in other.columns.values() {
            if !self.columns.contains_key(&col.name) {
                self.columns.insert(col.name.clone(), col.clone());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Render a `CREATE OR REPLACE TABLE` statement for this schema,
    /// attaching the primary key constraint when `pk_list` is non-empty.
    pub fn create_table_sql(
        &self,
        table_name: &str,
        pk_list: Option<&[String]>,
    ) -> Result<String, DuckFlowError> {
        if self.columns.is_empty() {
            return Err(DuckFlowError::Schema(format!(
                "cannot create table '{table_name}' without columns - add some first"
            )));
        }
        let mut parts: Vec<String> = self
            .columns
            .values()
            .map(|c| {
                let null = if c.nullable { "" } else { " not null" };
                format!("{} {}{null}", quote_ident(&c.name), c.logical_type.sql_type())
            })
            .collect();
        if let Some(pks) = pk_list {
            if !pks.is_empty() {
                parts.push(format!(
                    "primary key ({})",
                    pks.iter().map(|p| quote_ident(p)).join(", ")
                ));
            }
        }
        Ok(format!(
            "CREATE OR REPLACE TABLE {} ({})",
            quote_ident(table_name),
            parts.join(", ")
        ))
    }
}
