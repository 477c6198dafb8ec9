//! SCD2 transform: in-place conversion of CDC rows into slowly-changing
//! dimension type-2 versioning rows.
//!
//! The transform mutates the CDC table through a synonym; no new table is
//! produced. `I` and `U` rows become new active versions (downstream `I`,
//! end date = termination date); `B` and `D` rows become closing updates of
//! prior versions (downstream `U`, keeping the old key and start date so
//! the loader can update the existing row's end date and current flag).
//!
//! A pre-supplied start date is preserved on `I` rows
//! (`coalesce(start, $1)`), e.g. an order date that should become the
//! version start, while `U` rows overwrite unconditionally. This
//! asymmetry is deliberate: a changed row starts a new version now, not at
//! its original business date.

use chrono::{NaiveDateTime, Utc};
use tracing::debug;

use crate::cdc::CHANGE_TYPE_COLUMN;
use crate::compare::default_termination_date;
use crate::engine::{fetch_count, Engine, SqlValue};
use crate::error::DuckFlowError;
use crate::graph::{Dataflow, StepId};
use crate::schema::{Column, LogicalType};
use crate::sql::quote_ident;

/// Configuration of an SCD2 transform over a persisted CDC table.
#[derive(Debug, Clone)]
pub struct Scd2 {
    pub(crate) source: StepId,
    pub(crate) name: Option<String>,
    pub(crate) start_date_column: String,
    pub(crate) end_date_column: String,
    pub(crate) start_date: Option<NaiveDateTime>,
    pub(crate) end_date: Option<NaiveDateTime>,
    pub(crate) termination_date: NaiveDateTime,
    pub(crate) current_flag_column: Option<String>,
    pub(crate) current_flag_set: String,
    pub(crate) current_flag_unset: String,
}

impl Scd2 {
    pub fn new(
        source: StepId,
        start_date_column: impl Into<String>,
        end_date_column: impl Into<String>,
    ) -> Self {
        Scd2 {
            source,
            name: None,
            start_date_column: start_date_column.into(),
            end_date_column: end_date_column.into(),
            start_date: None,
            end_date: None,
            termination_date: default_termination_date(),
            current_flag_column: None,
            current_flag_set: "Y".to_string(),
            current_flag_unset: "N".to_string(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Version start for new and changed rows; defaults to now (UTC) at
    /// execute time.
    pub fn start_date(mut self, date: NaiveDateTime) -> Self {
        self.start_date = Some(date);
        self
    }

    /// End date written to closed versions; defaults to the start date.
    pub fn end_date(mut self, date: NaiveDateTime) -> Self {
        self.end_date = Some(date);
        self
    }

    /// End date of active versions; defaults to 9999-12-31.
    pub fn termination_date(mut self, date: NaiveDateTime) -> Self {
        self.termination_date = date;
        self
    }

    /// Column receiving the current-version flag; omitted from the update
    /// when unset.
    pub fn current_flag_column(mut self, column: impl Into<String>) -> Self {
        self.current_flag_column = Some(column.into());
        self
    }

    /// Flag value of the active version. Default `'Y'`.
    pub fn current_flag_set(mut self, value: impl Into<String>) -> Self {
        self.current_flag_set = value.into();
        self
    }

    /// Flag value of closed versions. Default `'N'`.
    pub fn current_flag_unset(mut self, value: impl Into<String>) -> Self {
        self.current_flag_unset = value.into();
        self
    }
}

/// Seed a target table's pending schema with the SCD2 columns.
pub(crate) fn add_default_columns(
    flow: &mut Dataflow,
    cfg: &Scd2,
    target: StepId,
) -> Result<(), DuckFlowError> {
    flow.append_column(
        target,
        Column::new(cfg.start_date_column.clone(), LogicalType::Timestamp),
    )?;
    flow.append_column(
        target,
        Column::new(cfg.end_date_column.clone(), LogicalType::Timestamp),
    )?;
    if let Some(flag) = &cfg.current_flag_column {
        flow.append_column(target, Column::new(flag.clone(), LogicalType::Varchar(Some(1))))?;
    }
    Ok(())
}

pub(crate) fn run(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &Scd2,
) -> Result<u64, DuckFlowError> {
    let table = quote_ident(
        &flow
            .table_name(id)
            .expect("SCD2 source is a persisted table"),
    );
    let start_date = cfg.start_date.unwrap_or_else(|| Utc::now().naive_utc());
    let end_date = cfg.end_date.unwrap_or(start_date);
    let start_col = quote_ident(&cfg.start_date_column);
    let end_col = quote_ident(&cfg.end_date_column);

    // $1 start, $2 end, $3 termination, $4/$5 the current flag values.
    let mut sql = format!(
        "update {table} set \
         {start_col} = case \
         when {CHANGE_TYPE_COLUMN} = 'I' then coalesce({start_col}, $1) \
         when {CHANGE_TYPE_COLUMN} = 'U' then $1 \
         when {CHANGE_TYPE_COLUMN} = 'B' or {CHANGE_TYPE_COLUMN} = 'D' then {start_col} end, \
         {end_col} = case \
         when {CHANGE_TYPE_COLUMN} = 'I' or {CHANGE_TYPE_COLUMN} = 'U' then $3 \
         when {CHANGE_TYPE_COLUMN} = 'B' or {CHANGE_TYPE_COLUMN} = 'D' then $2 end"
    );
    let mut params = vec![
        SqlValue::Timestamp(start_date),
        SqlValue::Timestamp(end_date),
        SqlValue::Timestamp(cfg.termination_date),
    ];
    if let Some(flag) = &cfg.current_flag_column {
        let flag_col = quote_ident(flag);
        sql.push_str(&format!(
            ", {flag_col} = case \
             when {CHANGE_TYPE_COLUMN} = 'I' or {CHANGE_TYPE_COLUMN} = 'U' then $4 \
             when {CHANGE_TYPE_COLUMN} = 'B' or {CHANGE_TYPE_COLUMN} = 'D' then $5 end"
        ));
        params.push(SqlValue::Text(cfg.current_flag_set.clone()));
        params.push(SqlValue::Text(cfg.current_flag_unset.clone()));
    }
    sql.push_str(&format!(
        ", {CHANGE_TYPE_COLUMN} = case \
         when {CHANGE_TYPE_COLUMN} = 'I' or {CHANGE_TYPE_COLUMN} = 'U' then 'I' \
         when {CHANGE_TYPE_COLUMN} = 'B' or {CHANGE_TYPE_COLUMN} = 'D' then 'U' end"
    ));
    debug!(sql = %sql, "scd2 conversion");
    engine.execute(&sql, &params)?;

    fetch_count(engine, &format!("select count(*) from {table}"), &[])
}
