//! The dataset model: named sources of rows.
//!
//! A dataset is one of three kinds, modelled as a tagged variant rather
//! than a class hierarchy:
//! - **Table** — persisted, addressed by a table name.
//! - **Query** — virtual, a parameterised SQL template whose `{name}`
//!   placeholders are replaced by the sub-select clauses of its inputs.
//! - **Synonym** — a distinct step identity sharing another table's
//!   storage; in-place transforms (SCD2, GenerateKey, CDCOperation) are
//!   synonyms of the CDC table produced by the comparison. Schema and
//!   primary-key mutations route to the wrapped table.
//!
//! Graph-aware resolution (sub-selects, schema discovery, synonym
//! delegation) lives on [`crate::graph::Dataflow`]; this module holds the
//! data and the construction-time validation.

use crate::error::DuckFlowError;
use crate::graph::StepId;
use crate::schema::TableSchema;

/// Internal dataset payload of every graph node.
#[derive(Debug, Clone)]
pub(crate) struct Dataset {
    /// Step name, also the placeholder key for query inputs.
    pub name: String,
    /// Whether a `__change_type` column is semantically present.
    pub is_cdc: bool,
    /// Logical primary key, possibly unresolved.
    pub pk_list: Option<Vec<String>>,
    /// Lazily resolved or accumulated schema.
    pub schema: Option<TableSchema>,
    /// Presentation projection; `None` means `*`.
    pub show_projection: Option<Vec<String>>,
    /// Presentation filter, raw SQL.
    pub show_where: Option<String>,
    pub kind: DatasetKind,
}

#[derive(Debug, Clone)]
pub(crate) enum DatasetKind {
    Table {
        table_name: String,
    },
    Query {
        sql: String,
        /// Placeholder name → input step.
        inputs: Vec<(String, StepId)>,
    },
    Synonym {
        of: StepId,
    },
}

impl Dataset {
    pub(crate) fn table(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Dataset {
            name: name.into(),
            is_cdc: false,
            pk_list: None,
            schema: None,
            show_projection: None,
            show_where: None,
            kind: DatasetKind::Table {
                table_name: table_name.into(),
            },
        }
    }

    pub(crate) fn synonym(name: impl Into<String>, of: StepId) -> Self {
        Dataset {
            name: name.into(),
            is_cdc: false,
            pk_list: None,
            schema: None,
            show_projection: None,
            show_where: None,
            kind: DatasetKind::Synonym { of },
        }
    }
}

/// Builder for a persisted table dataset.
#[derive(Debug, Clone)]
pub struct Table {
    pub(crate) name: String,
    pub(crate) table_name: String,
    pub(crate) is_cdc: bool,
    pub(crate) pk_list: Option<Vec<String>>,
}

impl Table {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            table_name: table_name.into(),
            is_cdc: false,
            pk_list: None,
        }
    }

    /// Mark the table as carrying CDC information (`__change_type`).
    pub fn cdc(mut self) -> Self {
        self.is_cdc = true;
        self
    }

    /// Declare the logical primary key.
    pub fn pk<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }
}

/// Builder for a virtual query dataset.
///
/// The SQL template references its inputs with `{dataset_name}`
/// placeholders; at sub-select time each placeholder is substituted with
/// the corresponding input's sub-select clause. Every placeholder must
/// resolve to a declared input, checked when the query is added to a
/// dataflow.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) name: String,
    pub(crate) sql: String,
    pub(crate) is_cdc: bool,
    pub(crate) pk_list: Option<Vec<String>>,
}

impl Query {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Query {
            name: name.into(),
            sql: sql.into(),
            is_cdc: false,
            pk_list: None,
        }
    }

    pub fn cdc(mut self) -> Self {
        self.is_cdc = true;
        self
    }

    pub fn pk<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }
}

/// Extract the `{word}` placeholders of a query template, in order of first
/// appearance, without duplicates.
pub(crate) fn placeholders(sql: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = sql[i + 1..].find('}') {
                let candidate = &sql[i + 1..i + 1 + end];
                if !candidate.is_empty()
                    && candidate
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_')
                    && !found.iter().any(|f| f == candidate)
                {
                    found.push(candidate.to_string());
                }
                i += end + 2;
                continue;
            }
        }
        i += 1;
    }
    found
}

/// Validate a query template against its declared input names.
pub(crate) fn validate_placeholders(
    sql: &str,
    input_names: &[String],
) -> Result<(), DuckFlowError> {
    let unresolved: Vec<String> = placeholders(sql)
        .into_iter()
        .filter(|p| !input_names.iter().any(|n| n == p))
        .collect();
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(DuckFlowError::Configuration(format!(
            "the sql contains the placeholders {unresolved:?} which match none of the \
             input datasets - available names are {input_names:?}"
        )))
    }
}
