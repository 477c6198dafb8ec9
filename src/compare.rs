//! Table comparison: the delta engine.
//!
//! Compares a source dataset against a comparison dataset (typically the
//! current target table) and materialises the row-level delta as a CDC
//! table `<source>_tc`: new rows tagged `I`, changed rows tagged `U` (after
//! image) and optionally `B` (before image), and optionally rows missing
//! from the source tagged `D`.
//!
//! The comparison handles the general shapes of a dimension target:
//! - The comparison table may carry more columns than the source (SCD2
//!   dates, surrogate keys); the delta keeps their current values on
//!   `U`/`B`/`D` rows and leaves them NULL on `I` rows.
//! - The comparison table may hold multiple rows per logical key; the row
//!   with the greatest `order_column` value is the one compared against.
//! - Columns can be excluded from the equality comparison while still
//!   being propagated (`columns_to_ignore`).
//! - An SCD2 comparison table is restricted to its active versions via
//!   `end_date_column` = `termination_date`, so a deleted-then-reinserted
//!   key becomes a new version instead of being compared against its
//!   closed one.
//!
//! The whole delta is one set-based statement; the primary key projection
//! uses tuple-IN, so key columns must be non-nullable.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::cdc::{CHANGE_TYPE, CHANGE_TYPE_COLUMN};
use crate::engine::{fetch_count, Engine, SqlValue};
use crate::error::DuckFlowError;
use crate::graph::{Dataflow, StepId};
use crate::sql::{col_list, join_condition, null_projection, prefixed_col_list, quote_ident};

/// Sentinel far-future date marking an open-ended active version.
pub(crate) fn default_termination_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .expect("valid date")
        .and_hms_opt(0, 0, 0)
        .expect("valid time")
}

/// Configuration of a table-comparison step.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub(crate) source: StepId,
    pub(crate) comparison: Option<StepId>,
    pub(crate) name: Option<String>,
    pub(crate) pk_list: Option<Vec<String>>,
    pub(crate) columns_to_ignore: Vec<String>,
    pub(crate) order_column: Option<String>,
    pub(crate) before_image: bool,
    pub(crate) detect_deletes: bool,
    pub(crate) end_date_column: Option<String>,
    pub(crate) termination_date: NaiveDateTime,
}

impl Comparison {
    /// Compare `source` against a comparison dataset set via
    /// [`Comparison::comparison`] or
    /// [`crate::graph::Dataflow::set_comparison_table`].
    pub fn new(source: StepId) -> Self {
        Comparison {
            source,
            comparison: None,
            name: None,
            pk_list: None,
            columns_to_ignore: Vec::new(),
            order_column: None,
            before_image: true,
            detect_deletes: false,
            end_date_column: None,
            termination_date: default_termination_date(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn comparison(mut self, comparison: StepId) -> Self {
        self.comparison = Some(comparison);
        self
    }

    /// Logical primary key. When absent it is resolved from the comparison
    /// table's catalog key, then the source table's.
    pub fn pk_list<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }

    /// Exclude columns from the equality comparison; they are still
    /// propagated into the delta.
    pub fn ignore_columns<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns_to_ignore = cols.into_iter().map(Into::into).collect();
        self
    }

    /// When the comparison table holds multiple rows per key, compare
    /// against the row with the greatest value in this column.
    pub fn order_column(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    /// Emit `B` (before image) rows for updates. Default: true.
    pub fn before_image(mut self, on: bool) -> Self {
        self.before_image = on;
        self
    }

    /// Emit `D` rows for keys present in the comparison table but missing
    /// from the source. Default: false.
    pub fn detect_deletes(mut self, on: bool) -> Self {
        self.detect_deletes = on;
        self
    }

    /// Restrict the comparison table to rows where this column equals the
    /// termination date (the active SCD2 versions).
    pub fn end_date_column(mut self, column: impl Into<String>) -> Self {
        self.end_date_column = Some(column.into());
        self
    }

    pub fn termination_date(mut self, date: NaiveDateTime) -> Self {
        self.termination_date = date;
        self
    }
}

pub(crate) fn run(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &Comparison,
) -> Result<u64, DuckFlowError> {
    let comparison = cfg.comparison.ok_or_else(|| {
        DuckFlowError::Configuration(
            "comparison dataset not set - call set_comparison_table first".into(),
        )
    })?;

    // PK resolution order: argument (already on this node), comparison
    // table, source table.
    let mut pk_list = flow.node(id).dataset.pk_list.clone();
    if pk_list.is_none() {
        pk_list = flow.table_primary_key(engine, comparison)?;
    }
    if pk_list.is_none() {
        pk_list = flow.table_primary_key(engine, cfg.source)?;
    }
    let pk_list = pk_list.ok_or_else(|| {
        DuckFlowError::NoPrimaryKey(
            "no logical primary key can be derived from the source or the comparison table - \
             provide pk_list"
                .into(),
        )
    })?;
    flow.node_mut(id).dataset.pk_list = Some(pk_list.clone());

    let mut input_cols = flow.cols(engine, cfg.source)?;
    // A CDC marker on either side never participates in the comparison.
    input_cols.shift_remove(CHANGE_TYPE);
    let mut comp_cols = flow.cols(engine, comparison)?;
    let comparison_has_change_type = comp_cols.shift_remove(CHANGE_TYPE);

    let compare_cols: Vec<&String> = input_cols
        .iter()
        .filter(|c| !cfg.columns_to_ignore.contains(*c))
        .collect();
    let extra_cols: Vec<&String> = comp_cols
        .iter()
        .filter(|c| !input_cols.contains(*c))
        .collect();

    let pks = col_list(&pk_list);
    let s_cols = prefixed_col_list("s", &input_cols);
    let t_cols = prefixed_col_list("t", &input_cols);
    let compare_list = col_list(&compare_cols);
    let null_extra = if extra_cols.is_empty() {
        String::new()
    } else {
        format!(", {}", null_projection(&extra_cols))
    };
    let t_extra = if extra_cols.is_empty() {
        String::new()
    } else {
        format!(", {}", prefixed_col_list("t", &extra_cols))
    };
    let s_extra = if extra_cols.is_empty() {
        String::new()
    } else {
        format!(", {}", prefixed_col_list("s", &extra_cols))
    };
    let join_st = join_condition(&pk_list, Some("s"), Some("t"));
    let join_kt = join_condition(&pk_list, Some("k"), Some("t"));
    let order_clause = cfg
        .order_column
        .as_ref()
        .map(|c| format!(" order by {} desc", quote_ident(c)))
        .unwrap_or_default();
    let version_filter = cfg
        .end_date_column
        .as_ref()
        .map(|c| format!(" where {} = $1", quote_ident(c)))
        .unwrap_or_default();

    let comparison_sub = flow.sub_select(comparison)?;
    let source_sub = flow.sub_select(cfg.source)?;

    let mut select = format!(
        "with comparison_table as {comparison_sub},\n\
         current_version as (\n\
         select * from (\n\
         select *, row_number() over (partition by {pks}{order_clause}) as \"__rownumber\"\n\
         from comparison_table{version_filter}\n\
         ) where \"__rownumber\" = 1\n\
         ),\n\
         source as {source_sub},\n\
         changed as (\n\
         select {compare_list} from source\n\
         except\n\
         select {compare_list} from current_version\n\
         )\n\
         select {s_cols}{null_extra}, 'I' as {CHANGE_TYPE_COLUMN}\n\
         from source as s\n\
         where ({pks}) not in (select {pks} from current_version)\n\
         union all\n\
         select {s_cols}{t_extra}, 'U' as {CHANGE_TYPE_COLUMN}\n\
         from source as s\n\
         join current_version as t on {join_st}\n\
         join changed as k on {join_kt}"
    );
    if cfg.before_image {
        select.push_str(&format!(
            "\nunion all\n\
             select {t_cols}{t_extra}, 'B' as {CHANGE_TYPE_COLUMN}\n\
             from source as s\n\
             join current_version as t on {join_st}\n\
             join changed as k on {join_kt}"
        ));
    }
    if cfg.detect_deletes {
        select.push_str(&format!(
            "\nunion all\n\
             select {s_cols}{s_extra}, 'D' as {CHANGE_TYPE_COLUMN}\n\
             from comparison_table as s\n\
             where ({pks}) not in (select {pks} from source)"
        ));
    }

    let out_table = quote_ident(
        &flow
            .table_name(id)
            .expect("comparison output is a persisted table"),
    );

    // Shape the output like the comparison table, then make sure it
    // carries the change-type marker.
    let create =
        format!("CREATE OR REPLACE TABLE {out_table} AS SELECT * FROM {comparison_sub} WITH NO DATA");
    debug!(sql = %create, "create comparison output");
    engine.execute(&create, &[])?;
    if !comparison_has_change_type {
        let alter = format!("ALTER TABLE {out_table} ADD COLUMN {CHANGE_TYPE_COLUMN} varchar(1)");
        debug!(sql = %alter, "add change-type column");
        engine.execute(&alter, &[])?;
    }
    flow.invalidate_schema(id);

    let mut out_list = col_list(&input_cols);
    if !extra_cols.is_empty() {
        out_list.push_str(&format!(", {}", col_list(&extra_cols)));
    }
    out_list.push_str(&format!(", {CHANGE_TYPE_COLUMN}"));
    let insert = format!("insert into {out_table}({out_list}) {select}");
    debug!(sql = %insert, "compute delta");
    let params = if cfg.end_date_column.is_some() {
        vec![SqlValue::Timestamp(cfg.termination_date)]
    } else {
        Vec::new()
    };
    engine.execute(&insert, &params)?;

    fetch_count(engine, &format!("select count(*) from {out_table}"), &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Query, Table};
    use crate::engine::mock::MockEngine;
    use crate::schema::{Column, LogicalType, TableSchema};
    use crate::sql::normalize_ws;

    fn customer_columns() -> Vec<Column> {
        vec![
            Column::new("Customer Id", LogicalType::Varchar(None)).not_null(),
            Column::new("First Name", LogicalType::Varchar(None)),
        ]
    }

    fn dim_columns() -> Vec<Column> {
        vec![
            Column::new("Customer Id", LogicalType::Varchar(None)),
            Column::new("First Name", LogicalType::Varchar(None)),
            Column::new("start_date", LogicalType::Timestamp),
            Column::new("end_date", LogicalType::Timestamp),
        ]
    }

    fn flow_with(engine: &MockEngine, cfg_builder: impl FnOnce(StepId, StepId) -> Comparison) -> (Dataflow, StepId) {
        engine.add_table("customer", customer_columns(), &["Customer Id"]);
        engine.add_table("customer_dim", dim_columns(), &[]);
        let mut flow = Dataflow::new();
        let src = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
        let dim = flow.add_table(Table::new("dim", "customer_dim"));
        let cmp = flow.add_comparison(cfg_builder(src, dim)).unwrap();
        (flow, cmp)
    }

    #[test]
    fn test_statement_sequence_create_alter_insert() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| Comparison::new(src).comparison(dim));
        flow.start(&engine, cmp).unwrap();
        let executed = engine.executed();
        assert_eq!(executed.len(), 3, "{executed:?}");
        assert_eq!(
            executed[0],
            "CREATE OR REPLACE TABLE \"customer_tc\" AS SELECT * FROM \
             (select * from \"customer_dim\") WITH NO DATA"
        );
        assert_eq!(
            executed[1],
            "ALTER TABLE \"customer_tc\" ADD COLUMN \"__change_type\" varchar(1)"
        );
        assert!(executed[2].starts_with("insert into \"customer_tc\""));
    }

    #[test]
    fn test_delta_statement_default_shape() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| Comparison::new(src).comparison(dim));
        flow.start(&engine, cmp).unwrap();
        let insert = normalize_ws(&engine.executed()[2]);

        assert_eq!(
            insert,
            normalize_ws(
                "insert into \"customer_tc\"(\"Customer Id\", \"First Name\", \
                 \"start_date\", \"end_date\", \"__change_type\") \
                 with comparison_table as (select * from \"customer_dim\"), \
                 current_version as ( \
                 select * from ( \
                 select *, row_number() over (partition by \"Customer Id\") as \"__rownumber\" \
                 from comparison_table \
                 ) where \"__rownumber\" = 1 \
                 ), \
                 source as (select * from \"customer\"), \
                 changed as ( \
                 select \"Customer Id\", \"First Name\" from source \
                 except \
                 select \"Customer Id\", \"First Name\" from current_version \
                 ) \
                 select s.\"Customer Id\", s.\"First Name\", \
                 null as \"start_date\", null as \"end_date\", 'I' as \"__change_type\" \
                 from source as s \
                 where (\"Customer Id\") not in (select \"Customer Id\" from current_version) \
                 union all \
                 select s.\"Customer Id\", s.\"First Name\", \
                 t.\"start_date\", t.\"end_date\", 'U' as \"__change_type\" \
                 from source as s \
                 join current_version as t on s.\"Customer Id\" = t.\"Customer Id\" \
                 join changed as k on k.\"Customer Id\" = t.\"Customer Id\" \
                 union all \
                 select t.\"Customer Id\", t.\"First Name\", \
                 t.\"start_date\", t.\"end_date\", 'B' as \"__change_type\" \
                 from source as s \
                 join current_version as t on s.\"Customer Id\" = t.\"Customer Id\" \
                 join changed as k on k.\"Customer Id\" = t.\"Customer Id\""
            )
        );
    }

    #[test]
    fn test_before_image_disabled_omits_b_branch() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| {
            Comparison::new(src).comparison(dim).before_image(false)
        });
        flow.start(&engine, cmp).unwrap();
        let insert = engine.executed()[2].clone();
        assert!(!insert.contains("'B' as"), "{insert}");
        assert!(insert.contains("'U' as"), "{insert}");
    }

    #[test]
    fn test_detect_deletes_appends_d_branch() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| {
            Comparison::new(src).comparison(dim).detect_deletes(true)
        });
        flow.start(&engine, cmp).unwrap();
        let insert = normalize_ws(&engine.executed()[2]);
        assert!(
            insert.contains(
                &normalize_ws(
                    "select s.\"Customer Id\", s.\"First Name\", s.\"start_date\", \
                     s.\"end_date\", 'D' as \"__change_type\" \
                     from comparison_table as s \
                     where (\"Customer Id\") not in (select \"Customer Id\" from source)"
                )
            ),
            "{insert}"
        );
    }

    #[test]
    fn test_order_column_sorts_versions_descending() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| {
            Comparison::new(src).comparison(dim).order_column("version_id")
        });
        flow.start(&engine, cmp).unwrap();
        let insert = engine.executed()[2].clone();
        assert!(
            insert.contains("partition by \"Customer Id\" order by \"version_id\" desc"),
            "{insert}"
        );
    }

    #[test]
    fn test_end_date_filter_binds_termination_date() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| {
            Comparison::new(src).comparison(dim).end_date_column("end_date")
        });
        flow.start(&engine, cmp).unwrap();
        let insert = engine.executed()[2].clone();
        assert!(insert.contains("from comparison_table where \"end_date\" = $1"), "{insert}");
        assert_eq!(
            engine.executed_params(2),
            vec![SqlValue::Timestamp(default_termination_date())]
        );
    }

    #[test]
    fn test_no_end_date_filter_binds_nothing() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| Comparison::new(src).comparison(dim));
        flow.start(&engine, cmp).unwrap();
        assert!(engine.executed_params(2).is_empty());
    }

    #[test]
    fn test_ignored_columns_left_out_of_changed_cte() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| {
            Comparison::new(src)
                .comparison(dim)
                .ignore_columns(["First Name"])
        });
        flow.start(&engine, cmp).unwrap();
        let insert = normalize_ws(&engine.executed()[2]);
        // The changed CTE compares only the key column...
        assert!(
            insert.contains(&normalize_ws(
                "changed as ( select \"Customer Id\" from source except \
                 select \"Customer Id\" from current_version )"
            )),
            "{insert}"
        );
        // ...but the projection still carries the ignored column.
        assert!(insert.contains("s.\"First Name\""), "{insert}");
    }

    #[test]
    fn test_comparison_with_change_type_skips_alter() {
        let engine = MockEngine::new();
        engine.add_table("customer", customer_columns(), &["Customer Id"]);
        let mut cdc_target = dim_columns();
        cdc_target.push(Column::new(CHANGE_TYPE, LogicalType::Varchar(Some(1))));
        engine.add_table("customer_cdc", cdc_target, &[]);

        let mut flow = Dataflow::new();
        let src = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
        let dim = flow.add_table(Table::new("dim", "customer_cdc"));
        let cmp = flow
            .add_comparison(Comparison::new(src).comparison(dim))
            .unwrap();
        flow.start(&engine, cmp).unwrap();

        let executed = engine.executed();
        assert_eq!(executed.len(), 2, "no ALTER expected: {executed:?}");
        // The marker is written, not compared.
        let insert = &executed[1];
        assert!(insert.contains(", \"__change_type\") "), "{insert}");
        assert!(!insert.contains("\"__change_type\" from source"), "{insert}");
    }

    #[test]
    fn test_pk_resolution_falls_back_to_comparison_catalog() {
        let engine = MockEngine::new();
        engine.add_table("customer", customer_columns(), &[]);
        engine.add_table("customer_dim", dim_columns(), &["Customer Id"]);
        let mut flow = Dataflow::new();
        // No declared key anywhere; the comparison table's catalog key wins.
        let src = flow.add_table(Table::new("customer", "customer"));
        let dim = flow.add_table(Table::new("dim", "customer_dim"));
        let cmp = flow
            .add_comparison(Comparison::new(src).comparison(dim))
            .unwrap();
        flow.start(&engine, cmp).unwrap();
        assert!(engine.executed()[2].contains("partition by \"Customer Id\""));
    }

    #[test]
    fn test_unresolvable_pk_is_a_resolution_error() {
        let engine = MockEngine::new();
        engine.add_table("customer", customer_columns(), &[]);
        engine.add_table("customer_dim", dim_columns(), &[]);
        let mut flow = Dataflow::new();
        let src = flow.add_table(Table::new("customer", "customer"));
        let dim = flow.add_table(Table::new("dim", "customer_dim"));
        let cmp = flow
            .add_comparison(Comparison::new(src).comparison(dim))
            .unwrap();
        let err = flow.start(&engine, cmp).unwrap_err();
        match err {
            DuckFlowError::StepFailed { source, .. } => {
                assert!(matches!(*source, DuckFlowError::NoPrimaryKey(_)))
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_comparison_dataset_is_a_configuration_error() {
        let engine = MockEngine::new();
        engine.add_table("customer", customer_columns(), &["Customer Id"]);
        let mut flow = Dataflow::new();
        let src = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
        let cmp = flow.add_comparison(Comparison::new(src)).unwrap();
        let err = flow.start(&engine, cmp).unwrap_err();
        match err {
            DuckFlowError::StepFailed { source, .. } => {
                assert!(matches!(*source, DuckFlowError::Configuration(_)))
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_query_source_resolves_through_sub_select() {
        let engine = MockEngine::new();
        engine.add_table("customer", customer_columns(), &["Customer Id"]);
        engine.add_table("customer_dim", dim_columns(), &[]);
        // The virtual dataset's shape comes from the scripted Arrow schema.
        engine.push_schema(TableSchema::from_columns(customer_columns()));

        let mut flow = Dataflow::new();
        let src = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
        let query = flow
            .add_query(
                Query::new("recent", "select * from {customer}").pk(["Customer Id"]),
                &[src],
            )
            .unwrap();
        let dim = flow.add_table(Table::new("dim", "customer_dim"));
        let cmp = flow
            .add_comparison(Comparison::new(query).comparison(dim))
            .unwrap();
        flow.start(&engine, cmp).unwrap();

        let insert = engine.executed()[2].clone();
        assert!(
            insert.contains("source as (select * from (select * from \"customer\"))"),
            "{insert}"
        );
        assert_eq!(flow.table_name(cmp).as_deref(), Some("recent_tc"));
    }

    #[test]
    fn test_delta_rows_counted() {
        let engine = MockEngine::new();
        let (mut flow, cmp) = flow_with(&engine, |src, dim| Comparison::new(src).comparison(dim));
        engine.push_fetch(vec![vec![SqlValue::Int(4)]]);
        flow.start(&engine, cmp).unwrap();
        assert_eq!(flow.last_execution(cmp).unwrap().rows_processed, 4);
    }
}
