//! Change-type vocabulary and the CDC post-processing step.
//!
//! Every CDC table carries the reserved single-character column
//! `__change_type`. Only `I`/`U`/`B`/`D` participate in the core
//! transforms; the remaining codes are reserved vocabulary for integration
//! with external CDC producers.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{fetch_count, Engine};
use crate::error::DuckFlowError;
use crate::graph::{Dataflow, StepId};
use crate::sql::{join_condition, quote_ident};

/// The reserved change-type column name.
pub const CHANGE_TYPE: &str = "__change_type";

/// The quoted change-type column reference.
pub const CHANGE_TYPE_COLUMN: &str = "\"__change_type\"";

/// Row-level change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowType {
    /// A brand new record; no record with this key existed before. Use
    /// [`RowType::Upsert`] when that is not guaranteed.
    #[serde(rename = "I")]
    Insert,
    /// After image of a change: the record holding the new values.
    #[serde(rename = "U")]
    Update,
    /// A deletion; the payload contains the complete latest row. Use
    /// [`RowType::Exterminate`] when only the key is known.
    #[serde(rename = "D")]
    Delete,
    /// Before image of a change: the record holding the old values.
    #[serde(rename = "B")]
    Before,
    /// Create-or-replace ("auto correct").
    #[serde(rename = "A")]
    Upsert,
    /// Delete by primary key only; all non-key fields are null.
    #[serde(rename = "X")]
    Exterminate,
    /// Mass delete on a key subset, e.g. all rows of one parent key.
    #[serde(rename = "T")]
    Truncate,
    /// Truncate-and-reload; the reloaded rows are tagged `R` instead of
    /// `I` so consumers can tell the two apart.
    #[serde(rename = "R")]
    Replace,
}

impl RowType {
    /// The single-character wire code.
    pub fn code(&self) -> char {
        match self {
            RowType::Insert => 'I',
            RowType::Update => 'U',
            RowType::Delete => 'D',
            RowType::Before => 'B',
            RowType::Upsert => 'A',
            RowType::Exterminate => 'X',
            RowType::Truncate => 'T',
            RowType::Replace => 'R',
        }
    }

    pub fn from_code(code: char) -> Result<Self, DuckFlowError> {
        match code {
            'I' => Ok(RowType::Insert),
            'U' => Ok(RowType::Update),
            'D' => Ok(RowType::Delete),
            'B' => Ok(RowType::Before),
            'A' => Ok(RowType::Upsert),
            'X' => Ok(RowType::Exterminate),
            'T' => Ok(RowType::Truncate),
            'R' => Ok(RowType::Replace),
            other => Err(DuckFlowError::Configuration(format!(
                "unknown change type code: {other}"
            ))),
        }
    }
}

/// In-place post-processor of a CDC table: remaps change types and sets
/// columns from the matched before-image row.
///
/// Example: the comparison tagged changed rows `U`, but every row should be
/// inserted into a history target, so `U` is mapped to `I`. Column
/// expressions are
/// raw SQL against the table itself and the before-image side aliased `b`;
/// they require a logical key so each after image finds its before image.
#[derive(Debug, Clone)]
pub struct CdcOperation {
    pub(crate) cdc_table: StepId,
    pub(crate) name: Option<String>,
    pub(crate) pk_list: Option<Vec<String>>,
    pub(crate) map_insert_to: Option<char>,
    pub(crate) map_update_to: Option<char>,
    pub(crate) map_before_to: Option<char>,
    pub(crate) map_delete_to: Option<char>,
    pub(crate) column_expressions: Vec<(String, String)>,
}

impl CdcOperation {
    pub fn new(cdc_table: StepId) -> Self {
        CdcOperation {
            cdc_table,
            name: None,
            pk_list: None,
            map_insert_to: None,
            map_update_to: None,
            map_before_to: None,
            map_delete_to: None,
            column_expressions: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Logical key used to match before images; defaults to the CDC
    /// table's key.
    pub fn pk_list<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }

    pub fn map_insert_to(mut self, code: char) -> Self {
        self.map_insert_to = Some(code);
        self
    }

    pub fn map_update_to(mut self, code: char) -> Self {
        self.map_update_to = Some(code);
        self
    }

    pub fn map_before_to(mut self, code: char) -> Self {
        self.map_before_to = Some(code);
        self
    }

    pub fn map_delete_to(mut self, code: char) -> Self {
        self.map_delete_to = Some(code);
        self
    }

    /// Set `column` to a raw SQL expression; the before-image row is
    /// available under the alias `b`.
    pub fn column_expression(
        mut self,
        column: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.column_expressions.push((column.into(), expression.into()));
        self
    }
}

pub(crate) fn run(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &CdcOperation,
) -> Result<u64, DuckFlowError> {
    let table_name = flow
        .table_name(id)
        .expect("CDCOperation input is a persisted table");
    let table = quote_ident(&table_name);

    let mappings = [
        (RowType::Insert, cfg.map_insert_to),
        (RowType::Update, cfg.map_update_to),
        (RowType::Before, cfg.map_before_to),
        (RowType::Delete, cfg.map_delete_to),
    ];
    let mapping_whens = mappings
        .iter()
        .filter_map(|(row_type, target)| {
            target.map(|t| {
                format!(
                    "when {CHANGE_TYPE_COLUMN} = '{}' then '{t}'",
                    row_type.code()
                )
            })
        })
        .join(" ");

    let mut assignments = Vec::new();
    if !mapping_whens.is_empty() {
        assignments.push(format!(
            "{CHANGE_TYPE_COLUMN} = case {mapping_whens} else {CHANGE_TYPE_COLUMN} end"
        ));
    }
    for (column, expression) in &cfg.column_expressions {
        assignments.push(format!("{} = {expression}", quote_ident(column)));
    }
    if assignments.is_empty() {
        return Err(DuckFlowError::Configuration(
            "CDCOperation without mappings or column expressions has nothing to do".into(),
        ));
    }

    let mut sql = format!("update {table} set {}", assignments.join(", "));
    if !cfg.column_expressions.is_empty() {
        let pk_list = cfg
            .pk_list
            .clone()
            .or_else(|| flow.declared_pk(cfg.cdc_table))
            .ok_or_else(|| {
                DuckFlowError::Configuration(
                    "column expressions need the logical primary key to match each \
                     before image to its after image"
                        .into(),
                )
            })?;
        let join = join_condition(&pk_list, None, Some("b"));
        sql.push_str(&format!(
            " from {table} b where {join} and b.{CHANGE_TYPE_COLUMN} = 'B'"
        ));
    }
    debug!(sql = %sql, "cdc operation");
    engine.execute(&sql, &[])?;

    fetch_count(engine, &format!("select count(*) from {table}"), &[])
}
