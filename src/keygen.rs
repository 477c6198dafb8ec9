//! Surrogate-key assignment for insert rows of a CDC table.
//!
//! Creates (or replaces) a sequence `<cdc_table>_seq` and updates the
//! surrogate-key column of every `I` row with its next values. The start
//! value is either fixed or `max(key) + 1` read from the target table, so
//! repeated runs continue from where the target left off and keys stay
//! unique across runs.

use tracing::debug;

use crate::cdc::CHANGE_TYPE_COLUMN;
use crate::engine::{fetch_count, fetch_optional_i64, Engine};
use crate::error::DuckFlowError;
use crate::graph::{Dataflow, StepId};
use crate::schema::{Column, LogicalType};
use crate::sql::{nextval, quote_ident};

/// Where the sequence start value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartValue {
    /// A fixed start value.
    Fixed(i64),
    /// `max(surrogate key) + 1` of this table; an empty table starts at 1.
    MaxOf(StepId),
}

/// Configuration of a surrogate-key assignment step.
#[derive(Debug, Clone)]
pub struct GenerateKey {
    pub(crate) cdc_table: StepId,
    pub(crate) start_value: StartValue,
    pub(crate) name: Option<String>,
    pub(crate) surrogate_key_column: Option<String>,
}

impl GenerateKey {
    pub fn new(cdc_table: StepId, start_value: StartValue) -> Self {
        GenerateKey {
            cdc_table,
            start_value,
            name: None,
            surrogate_key_column: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Key column to fill. When absent, the single-column primary key of
    /// the [`StartValue::MaxOf`] table is used; required for
    /// [`StartValue::Fixed`].
    pub fn surrogate_key_column(mut self, column: impl Into<String>) -> Self {
        self.surrogate_key_column = Some(column.into());
        self
    }
}

/// Seed the target table's pending schema with the key column and make it
/// the primary key.
pub(crate) fn add_default_columns(
    flow: &mut Dataflow,
    cfg: &GenerateKey,
    target: StepId,
) -> Result<(), DuckFlowError> {
    if let Some(key) = &cfg.surrogate_key_column {
        flow.append_column(target, Column::new(key.clone(), LogicalType::Integer))?;
        flow.set_pk(target, [key.clone()]);
    }
    Ok(())
}

pub(crate) fn run(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &GenerateKey,
) -> Result<u64, DuckFlowError> {
    let key_column = match (&cfg.surrogate_key_column, cfg.start_value) {
        (Some(key), _) => key.clone(),
        (None, StartValue::MaxOf(target)) => {
            let pks = flow.table_primary_key(engine, target)?.ok_or_else(|| {
                DuckFlowError::NoPrimaryKey(format!(
                    "target table '{}' has no primary key - specify the surrogate key column",
                    flow.step_name(target)
                ))
            })?;
            if pks.len() != 1 {
                return Err(DuckFlowError::NoPrimaryKey(format!(
                    "key generation needs a single-column primary key on '{}' but found \
                     {pks:?} - specify the surrogate key column",
                    flow.step_name(target)
                )));
            }
            pks.into_iter().next().expect("one primary key column")
        }
        (None, StartValue::Fixed(_)) => {
            return Err(DuckFlowError::Configuration(
                "no target table for the start value - specify the surrogate key column".into(),
            ))
        }
    };

    let start = match cfg.start_value {
        StartValue::Fixed(value) => value,
        StartValue::MaxOf(target) => {
            let target_table = flow.table_name(target).ok_or_else(|| {
                DuckFlowError::Configuration(format!(
                    "start value table '{}' is not persisted",
                    flow.step_name(target)
                ))
            })?;
            let sql = format!(
                "select max({}) from {}",
                quote_ident(&key_column),
                quote_ident(&target_table)
            );
            debug!(sql = %sql, "read key start value");
            match fetch_optional_i64(engine, &sql)? {
                Some(max) => max + 1,
                None => 1,
            }
        }
    };

    let table_name = flow
        .table_name(id)
        .expect("GenerateKey input is a persisted table");
    let sequence = format!("{table_name}_seq");
    engine.create_sequence(&sequence, start)?;

    let update = format!(
        "update {} set {} = {} where {CHANGE_TYPE_COLUMN} = 'I'",
        quote_ident(&table_name),
        quote_ident(&key_column),
        nextval(&sequence)
    );
    debug!(sql = %update, "assign surrogate keys");
    engine.execute(&update, &[])?;

    fetch_count(
        engine,
        &format!(
            "select count(*) from {} where {CHANGE_TYPE_COLUMN} = 'I'",
            quote_ident(&table_name)
        ),
        &[],
    )
}
