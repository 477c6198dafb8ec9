//! Loaders: apply a dataset to a persistent target.
//!
//! [`TableLoader`] writes to a local analytic table. The action depends on
//! the source and target shapes:
//! - CDC source, plain target, known key → apply the stream: insert `I`
//!   rows, update `U` rows by key, delete `D` rows by key, in that order.
//! - CDC source and CDC target → append (CDC-to-CDC copy).
//! - plain source, key known → upsert (`INSERT OR REPLACE` when the
//!   target's own primary key is used, update-then-insert for a logical
//!   key).
//! - plain source, no key → append.
//!
//! [`DeltaLakeLoader`] merges into a lakehouse table through the engine's
//! `merge` operation using the format's native three-clause semantics.
//!
//! Both loaders can fill a surrogate key from a sequence seeded with
//! `max(key) + 1` read from the target.

use tracing::debug;

use crate::cdc::{CHANGE_TYPE, CHANGE_TYPE_COLUMN};
use crate::engine::{
    fetch_count, fetch_optional_i64, Engine, LakehouseOp, MergeAssignments, MergeSpec,
};
use crate::error::DuckFlowError;
use crate::graph::{Dataflow, StepId};
use crate::schema::{Column, LogicalType};
use crate::sql::{col_list, join_condition, nextval, quote_ident};

/// Configuration of a local-table loader.
#[derive(Debug, Clone)]
pub struct TableLoader {
    pub(crate) source: StepId,
    pub(crate) table_name: String,
    pub(crate) name: Option<String>,
    pub(crate) pk_list: Option<Vec<String>>,
    pub(crate) allow_evolution: bool,
    pub(crate) is_cdc: bool,
    pub(crate) generated_key_column: Option<String>,
    pub(crate) start_value: Option<i64>,
}

impl TableLoader {
    pub fn new(source: StepId, table_name: impl Into<String>) -> Self {
        TableLoader {
            source,
            table_name: table_name.into(),
            name: None,
            pk_list: None,
            allow_evolution: false,
            is_cdc: false,
            generated_key_column: None,
            start_value: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The target's key. This is the physical key of the target, not the
    /// source's logical key; when absent it is read from the catalog.
    pub fn pk_list<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }

    /// Append source columns missing on the target before loading.
    pub fn allow_evolution(mut self, on: bool) -> Self {
        self.allow_evolution = on;
        self
    }

    /// Mark the target as a CDC table; a CDC source is then appended
    /// verbatim instead of applied.
    pub fn cdc(mut self) -> Self {
        self.is_cdc = true;
        self
    }

    /// Fill this column from a sequence for inserted rows.
    pub fn generated_key_column(mut self, column: impl Into<String>) -> Self {
        self.generated_key_column = Some(column.into());
        self
    }

    /// Sequence start; defaults to `max(key) + 1` read from the target.
    pub fn start_value(mut self, value: i64) -> Self {
        self.start_value = Some(value);
        self
    }
}

/// Configuration of a lakehouse (Delta) loader.
#[derive(Debug, Clone)]
pub struct DeltaLakeLoader {
    pub(crate) root_url: String,
    pub(crate) source: StepId,
    pub(crate) table_name: String,
    pub(crate) name: Option<String>,
    pub(crate) pk_list: Option<Vec<String>>,
    pub(crate) is_cdc: bool,
    pub(crate) generated_key_column: Option<String>,
    pub(crate) start_value: Option<i64>,
}

impl DeltaLakeLoader {
    pub fn new(
        root_url: impl Into<String>,
        source: StepId,
        table_name: impl Into<String>,
    ) -> Self {
        DeltaLakeLoader {
            root_url: root_url.into(),
            source,
            table_name: table_name.into(),
            name: None,
            pk_list: None,
            is_cdc: false,
            generated_key_column: None,
            start_value: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pk_list<I, S>(mut self, pk_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_list = Some(pk_list.into_iter().map(Into::into).collect());
        self
    }

    pub fn cdc(mut self) -> Self {
        self.is_cdc = true;
        self
    }

    pub fn generated_key_column(mut self, column: impl Into<String>) -> Self {
        self.generated_key_column = Some(column.into());
        self
    }

    pub fn start_value(mut self, value: i64) -> Self {
        self.start_value = Some(value);
        self
    }
}

/// Seed a target table's pending schema with the loader's columns: the
/// generated key (which becomes the primary key) and, for CDC targets,
/// the change-type marker.
pub(crate) fn add_default_columns(
    flow: &mut Dataflow,
    target: StepId,
    generated_key_column: Option<&str>,
    is_cdc: bool,
) -> Result<(), DuckFlowError> {
    if let Some(key) = generated_key_column {
        flow.append_column(target, Column::new(key, LogicalType::Integer))?;
        flow.set_pk(target, [key]);
    }
    if is_cdc {
        flow.append_column(target, Column::new(CHANGE_TYPE, LogicalType::Varchar(Some(1))))?;
    }
    Ok(())
}

fn sequence_start(
    engine: &dyn Engine,
    start_value: Option<i64>,
    max_sql: &str,
) -> Result<i64, DuckFlowError> {
    if let Some(value) = start_value {
        return Ok(value);
    }
    debug!(sql = %max_sql, "read key start value");
    Ok(match fetch_optional_i64(engine, max_sql)? {
        Some(max) => max + 1,
        None => 1,
    })
}

pub(crate) fn run_table(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &TableLoader,
) -> Result<u64, DuckFlowError> {
    let target_table = cfg.table_name.clone();
    let tt = quote_ident(&target_table);

    // The physical key of the target wins; an argument key that matches it
    // enables `INSERT OR REPLACE`, a diverging argument key forces the
    // logical upsert.
    let catalog_pk = engine.primary_key(&target_table)?;
    let declared_pk = flow.node(id).dataset.pk_list.clone();
    let (pk_list, use_table_pk) = match (declared_pk, catalog_pk) {
        (None, Some(pk)) => (Some(pk), true),
        (Some(declared), Some(pk)) => {
            let same = declared == pk;
            (Some(declared), same)
        }
        (declared, None) => (declared, false),
    };
    if pk_list.is_some() {
        flow.node_mut(id).dataset.pk_list = pk_list.clone();
    }

    let source_is_cdc = flow.is_cdc(cfg.source);
    let mut cols = flow.cols(engine, cfg.source)?;

    if cfg.allow_evolution {
        let target_schema = flow.schema_of(engine, id)?;
        let source_schema = flow.schema_of(engine, cfg.source)?;
        let mut evolved = false;
        for column in source_schema.columns() {
            if column.name != CHANGE_TYPE && !target_schema.contains(&column.name) {
                let alter = format!(
                    "ALTER TABLE {tt} ADD COLUMN {} {}",
                    quote_ident(&column.name),
                    column.logical_type.sql_type()
                );
                debug!(sql = %alter, "evolve target schema");
                engine.execute(&alter, &[])?;
                evolved = true;
            }
        }
        if evolved {
            flow.invalidate_schema(id);
        }
    }

    if !flow.cols(engine, id)?.contains(CHANGE_TYPE) {
        cols.shift_remove(CHANGE_TYPE);
    }

    // Surrogate-key injection: a per-target sequence continuing from the
    // target's current maximum.
    let mut key_columns = String::new();
    let mut insert_values = String::new();
    let mut append_values = String::new();
    if let Some(key) = &cfg.generated_key_column {
        let sequence = format!("{target_table}_seq");
        let start = sequence_start(
            engine,
            cfg.start_value,
            &format!("select max({}) from {tt}", quote_ident(key)),
        )?;
        engine.create_sequence(&sequence, start)?;
        let key_ref = quote_ident(key);
        let next = nextval(&sequence);
        let source_has_key = cols.shift_remove(key);
        key_columns = format!(", {key_ref}");
        insert_values = format!(", {next}");
        append_values = if source_is_cdc && source_has_key {
            format!(", case when {CHANGE_TYPE_COLUMN} = 'I' then {next} else {key_ref} end as {key_ref}")
        } else if source_has_key {
            format!(", coalesce({key_ref}, {next}) as {key_ref}")
        } else {
            format!(", {next}")
        };
    }

    let cols_list = col_list(&cols);
    let source_sub = flow.sub_select(cfg.source)?;
    let target_is_cdc = cfg.is_cdc;

    if source_is_cdc && target_is_cdc {
        // CDC to CDC: the stream is appended verbatim.
        let insert = format!(
            "with source as {source_sub} \
             INSERT INTO {tt}({cols_list}{key_columns}) \
             SELECT {cols_list}{append_values} from source"
        );
        debug!(sql = %insert, "append cdc stream");
        engine.execute(&insert, &[])?;
    } else if source_is_cdc {
        let pk_list = pk_list.ok_or_else(|| {
            DuckFlowError::NoPrimaryKey(format!(
                "applying a CDC stream to '{target_table}' needs a primary key - \
                 none declared and none in the catalog"
            ))
        })?;
        let pks = col_list(&pk_list);
        let assignments = update_assignments(&cols, &pk_list, cfg.generated_key_column.as_deref());
        let join = join_condition(&pk_list, Some("s"), Some(&tt));

        let insert = format!(
            "with source as {source_sub} \
             INSERT INTO {tt}({cols_list}{key_columns}) \
             SELECT {cols_list}{insert_values} from source \
             where {CHANGE_TYPE_COLUMN} = 'I'"
        );
        debug!(sql = %insert, "apply inserts");
        engine.execute(&insert, &[])?;

        let update = format!(
            "with source as {source_sub} \
             UPDATE {tt} set {assignments} from source s \
             where {join} and s.{CHANGE_TYPE_COLUMN} = 'U'"
        );
        debug!(sql = %update, "apply updates");
        engine.execute(&update, &[])?;

        let delete = format!(
            "with source as {source_sub} \
             DELETE FROM {tt} \
             where ({pks}) in (SELECT {pks} from source where {CHANGE_TYPE_COLUMN} = 'D')"
        );
        debug!(sql = %delete, "apply deletes");
        engine.execute(&delete, &[])?;
    } else if use_table_pk {
        let upsert = format!(
            "with source as {source_sub} \
             INSERT OR REPLACE INTO {tt}({cols_list}) \
             SELECT {cols_list} from source"
        );
        debug!(sql = %upsert, "upsert by table key");
        engine.execute(&upsert, &[])?;
    } else if let Some(pk_list) = &pk_list {
        let pks = col_list(pk_list);
        let assignments = update_assignments(&cols, pk_list, cfg.generated_key_column.as_deref());
        let join = join_condition(pk_list, Some("s"), Some(&tt));

        let update = format!(
            "with source as {source_sub} \
             UPDATE {tt} set {assignments} from source s \
             where {join}"
        );
        debug!(sql = %update, "upsert: update matches");
        engine.execute(&update, &[])?;

        let insert = format!(
            "with source as {source_sub} \
             INSERT INTO {tt}({cols_list}) \
             SELECT {cols_list} from source \
             where ({pks}) not in (select {pks} from {tt})"
        );
        debug!(sql = %insert, "upsert: insert missing");
        engine.execute(&insert, &[])?;
    } else {
        let insert = format!(
            "with source as {source_sub} \
             INSERT INTO {tt}({cols_list}{key_columns}) \
             SELECT {cols_list}{append_values} from source"
        );
        debug!(sql = %insert, "append");
        engine.execute(&insert, &[])?;
    }

    fetch_count(
        engine,
        &format!("with source as {source_sub} select count(*) from source"),
        &[],
    )
}

fn update_assignments(
    cols: &indexmap::IndexSet<String>,
    pk_list: &[String],
    generated_key: Option<&str>,
) -> String {
    use itertools::Itertools;
    cols.iter()
        .filter(|c| !pk_list.contains(*c) && Some(c.as_str()) != generated_key)
        .map(|c| format!("{} = s.{}", quote_ident(c), quote_ident(c)))
        .join(", ")
}

pub(crate) fn run_delta(
    flow: &mut Dataflow,
    engine: &dyn Engine,
    id: StepId,
    cfg: &DeltaLakeLoader,
) -> Result<u64, DuckFlowError> {
    let target = format!(
        "{}/{}",
        cfg.root_url.trim_end_matches('/'),
        cfg.table_name
    );
    let source_is_cdc = flow.is_cdc(cfg.source);
    let mut cols = flow.cols(engine, cfg.source)?;

    let mut key_projection = String::new();
    if let Some(key) = &cfg.generated_key_column {
        let sequence = format!("{}_seq", cfg.table_name);
        let start = sequence_start(
            engine,
            cfg.start_value,
            &format!(
                "select max({}) from delta_scan('{target}')",
                quote_ident(key)
            ),
        )?;
        engine.create_sequence(&sequence, start)?;
        let key_ref = quote_ident(key);
        let next = nextval(&sequence);
        key_projection = if source_is_cdc {
            format!(", case when {CHANGE_TYPE_COLUMN} = 'I' then {next} else {key_ref} end as {key_ref}")
        } else {
            format!(", coalesce({key_ref}, {next}) as {key_ref}")
        };
        cols.shift_remove(key);
    }

    let source_sub = flow.sub_select(cfg.source)?;
    let source_sql = format!(
        "with source as {source_sub} SELECT {}{key_projection} from source",
        col_list(&cols)
    );

    let pk_list = flow.node(id).dataset.pk_list.clone();
    // Payload columns written to the target: the marker column drives the
    // merge predicates but is only written when the target itself is CDC.
    let payload: Vec<&String> = cols
        .iter()
        .filter(|c| cfg.is_cdc || c.as_str() != CHANGE_TYPE)
        .collect();

    let op = if source_is_cdc && !cfg.is_cdc {
        let pk_list = pk_list.ok_or_else(|| {
            DuckFlowError::NoPrimaryKey(format!(
                "merging a CDC stream into '{target}' needs a primary key"
            ))
        })?;
        let assignments = merge_assignments(&payload, &pk_list, None);
        let mut inserts = merge_assignments(&payload, &pk_list, Some(&pk_list));
        if let Some(key) = &cfg.generated_key_column {
            inserts.push((quote_ident(key), format!("s.{}", quote_ident(key))));
        }
        LakehouseOp::Merge(MergeSpec {
            source_sql,
            predicate: join_condition(&pk_list, Some("s"), Some("t")),
            matched_delete: Some(format!("s.{CHANGE_TYPE_COLUMN} = 'D'")),
            matched_update: Some(MergeAssignments {
                assignments,
                predicate: Some(format!("s.{CHANGE_TYPE_COLUMN} = 'U'")),
            }),
            not_matched_insert: Some(MergeAssignments {
                assignments: inserts,
                predicate: Some(format!("s.{CHANGE_TYPE_COLUMN} = 'I'")),
            }),
        })
    } else if let Some(pk_list) = pk_list {
        let assignments = merge_assignments(&payload, &pk_list, None);
        let mut inserts = merge_assignments(&payload, &pk_list, Some(&pk_list));
        if let Some(key) = &cfg.generated_key_column {
            inserts.push((quote_ident(key), format!("s.{}", quote_ident(key))));
        }
        LakehouseOp::Merge(MergeSpec {
            source_sql,
            predicate: join_condition(&pk_list, Some("s"), Some("t")),
            matched_delete: None,
            matched_update: Some(MergeAssignments {
                assignments,
                predicate: None,
            }),
            not_matched_insert: Some(MergeAssignments {
                assignments: inserts,
                predicate: None,
            }),
        })
    } else {
        LakehouseOp::Append { source_sql }
    };

    debug!(target = %target, "lakehouse merge");
    engine.merge(&target, &op)
}

/// `(column, s.column)` pairs. Non-key columns by default; passing
/// `include_keys` adds the key columns too (insert clauses).
fn merge_assignments(
    payload: &[&String],
    pk_list: &[String],
    include_keys: Option<&[String]>,
) -> Vec<(String, String)> {
    let mut assignments: Vec<(String, String)> = Vec::new();
    if let Some(keys) = include_keys {
        for key in keys {
            assignments.push((quote_ident(key), format!("s.{}", quote_ident(key))));
        }
    }
    for col in payload {
        if !pk_list.contains(*col) {
            assignments.push((quote_ident(col), format!("s.{}", quote_ident(col))));
        }
    }
    assignments
}
