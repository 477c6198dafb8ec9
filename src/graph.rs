//! The dataflow graph and its executor.
//!
//! A [`Dataflow`] is an arena of steps linked by symmetric input/output
//! edges. Edges are append-only and checked for cycles at insertion time.
//! Execution is single-threaded and cooperative: `start` walks the graph
//! recursively, executing every step at most once per run. A step first
//! pulls its unexecuted inputs, then runs its own `execute`, then pushes
//! into its unexecuted outputs. `completed` resets the executed flags
//! across the connected component so the graph can be re-run against new
//! source data.
//!
//! Ordering guarantees: a step observes all its transitive inputs completed
//! before its own execute; sibling order is unspecified and steps must not
//! depend on it. A failing execute aborts the walk, leaves finished
//! predecessors marked executed, and surfaces the step name in the error.

use indexmap::IndexSet;
use tracing::info;

use crate::cdc::CdcOperation;
use crate::compare::Comparison;
use crate::dataset::{validate_placeholders, Dataset, DatasetKind, Query, Table};
use crate::engine::{Engine, SqlValue};
use crate::error::DuckFlowError;
use crate::keygen::GenerateKey;
use crate::load::{DeltaLakeLoader, TableLoader};
use crate::metrics::{OperationalMetadata, StepReport};
use crate::scd2::Scd2;
use crate::schema::{Column, TableSchema};
use crate::sql::{col_list, quote_ident};

/// Handle to a step of a [`Dataflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub(crate) usize);

/// Behaviour of a node. Plain datasets are sources with a no-op execute.
#[derive(Debug, Clone)]
pub(crate) enum StepKind {
    Source,
    Comparison(Comparison),
    Scd2(Scd2),
    GenerateKey(GenerateKey),
    CdcOperation(CdcOperation),
    TableLoader(TableLoader),
    DeltaLakeLoader(DeltaLakeLoader),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub dataset: Dataset,
    pub step: StepKind,
    pub inputs: Vec<StepId>,
    pub outputs: Vec<StepId>,
    pub executed: bool,
    pub execute_lock: bool,
    pub last_execution: Option<OperationalMetadata>,
}

/// A CDC / SCD2 pipeline: datasets, transforms and loaders wired into a
/// DAG, executed against one engine connection.
#[derive(Debug, Default)]
pub struct Dataflow {
    nodes: Vec<Node>,
    last_run: Option<OperationalMetadata>,
}

impl Dataflow {
    pub fn new() -> Self {
        Dataflow::default()
    }

    // ── Construction ────────────────────────────────────────────────────

    fn push_node(&mut self, dataset: Dataset, step: StepKind) -> StepId {
        let id = StepId(self.nodes.len());
        self.nodes.push(Node {
            dataset,
            step,
            inputs: Vec::new(),
            outputs: Vec::new(),
            executed: false,
            execute_lock: false,
            last_execution: None,
        });
        id
    }

    /// Register a persisted table dataset.
    pub fn add_table(&mut self, table: Table) -> StepId {
        let mut dataset = Dataset::table(table.name, table.table_name);
        dataset.is_cdc = table.is_cdc;
        dataset.pk_list = table.pk_list;
        self.push_node(dataset, StepKind::Source)
    }

    /// Register a virtual query dataset over the given inputs.
    ///
    /// Every `{name}` placeholder of the template must name one of the
    /// inputs' datasets.
    pub fn add_query(&mut self, query: Query, inputs: &[StepId]) -> Result<StepId, DuckFlowError> {
        for input in inputs {
            self.check(*input)?;
        }
        let input_names: Vec<String> = inputs
            .iter()
            .map(|i| self.nodes[i.0].dataset.name.clone())
            .collect();
        validate_placeholders(&query.sql, &input_names)?;
        let dataset = Dataset {
            name: query.name,
            is_cdc: query.is_cdc,
            pk_list: query.pk_list,
            schema: None,
            show_projection: None,
            show_where: None,
            kind: DatasetKind::Query {
                sql: query.sql,
                inputs: input_names.into_iter().zip(inputs.iter().copied()).collect(),
            },
        };
        let id = self.push_node(dataset, StepKind::Source);
        for input in inputs {
            self.add_edge(*input, id)?;
        }
        Ok(id)
    }

    /// Add a table-comparison step producing the CDC table
    /// `<source name>_tc`.
    pub fn add_comparison(&mut self, cfg: Comparison) -> Result<StepId, DuckFlowError> {
        self.check(cfg.source)?;
        if let Some(comparison) = cfg.comparison {
            self.check(comparison)?;
        }
        let source_name = self.nodes[cfg.source.0].dataset.name.clone();
        let name = cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("comparison for {source_name}"));
        let mut dataset = Dataset::table(name, format!("{source_name}_tc"));
        dataset.is_cdc = true;
        dataset.pk_list = cfg
            .pk_list
            .clone()
            .or_else(|| self.nodes[cfg.source.0].dataset.pk_list.clone());
        let source = cfg.source;
        let id = self.push_node(dataset, StepKind::Comparison(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Add an in-place SCD2 transform over a persisted CDC table.
    pub fn add_scd2(&mut self, cfg: Scd2) -> Result<StepId, DuckFlowError> {
        self.check(cfg.source)?;
        if !self.is_persisted(cfg.source) {
            return Err(DuckFlowError::Configuration(
                "SCD2 requires a persisted source table as it updates rows in place".into(),
            ));
        }
        if !self.is_cdc(cfg.source) {
            return Err(DuckFlowError::Configuration(
                "SCD2 source must be a CDC dataset".into(),
            ));
        }
        let name = cfg.name.clone().unwrap_or_else(|| {
            format!(
                "scd2 for {}",
                self.table_name(cfg.source)
                    .unwrap_or_else(|| self.nodes[cfg.source.0].dataset.name.clone())
            )
        });
        let source = cfg.source;
        let mut dataset = Dataset::synonym(name, source);
        dataset.is_cdc = true;
        let id = self.push_node(dataset, StepKind::Scd2(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Add an in-place surrogate-key assignment over a persisted CDC table.
    pub fn add_generate_key(&mut self, cfg: GenerateKey) -> Result<StepId, DuckFlowError> {
        self.check(cfg.cdc_table)?;
        if let crate::keygen::StartValue::MaxOf(table) = cfg.start_value {
            self.check(table)?;
        }
        if !self.is_persisted(cfg.cdc_table) {
            return Err(DuckFlowError::Configuration(
                "GenerateKey requires a persisted table as it updates rows in place".into(),
            ));
        }
        let name = cfg.name.clone().unwrap_or_else(|| {
            format!(
                "generate key for {}",
                self.table_name(cfg.cdc_table)
                    .unwrap_or_else(|| self.nodes[cfg.cdc_table.0].dataset.name.clone())
            )
        });
        let source = cfg.cdc_table;
        let mut dataset = Dataset::synonym(name, source);
        dataset.is_cdc = true;
        let id = self.push_node(dataset, StepKind::GenerateKey(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Add an in-place change-type remap / before-image expression step.
    pub fn add_cdc_operation(&mut self, cfg: CdcOperation) -> Result<StepId, DuckFlowError> {
        self.check(cfg.cdc_table)?;
        if !self.is_cdc(cfg.cdc_table) {
            return Err(DuckFlowError::Configuration(
                "CDCOperation input must be a CDC dataset".into(),
            ));
        }
        if !self.is_persisted(cfg.cdc_table) {
            return Err(DuckFlowError::Configuration(
                "CDCOperation input must be a persisted table".into(),
            ));
        }
        let name = cfg.name.clone().unwrap_or_else(|| {
            format!(
                "cdc operation for {}",
                self.table_name(cfg.cdc_table)
                    .unwrap_or_else(|| self.nodes[cfg.cdc_table.0].dataset.name.clone())
            )
        });
        let source = cfg.cdc_table;
        let mut dataset = Dataset::synonym(name, source);
        dataset.is_cdc = true;
        let id = self.push_node(dataset, StepKind::CdcOperation(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Add a loader applying its source to a local analytic table.
    pub fn add_table_loader(&mut self, cfg: TableLoader) -> Result<StepId, DuckFlowError> {
        self.check(cfg.source)?;
        let name = cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("target table {}", cfg.table_name));
        let mut dataset = Dataset::table(name, cfg.table_name.clone());
        dataset.is_cdc = cfg.is_cdc;
        dataset.pk_list = cfg.pk_list.clone();
        let source = cfg.source;
        let id = self.push_node(dataset, StepKind::TableLoader(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Add a loader merging its source into a lakehouse table.
    pub fn add_delta_lake_loader(
        &mut self,
        cfg: DeltaLakeLoader,
    ) -> Result<StepId, DuckFlowError> {
        self.check(cfg.source)?;
        let name = cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("lakehouse table {}", cfg.table_name));
        let mut dataset = Dataset::table(name, cfg.table_name.clone());
        dataset.is_cdc = cfg.is_cdc;
        dataset.pk_list = cfg.pk_list.clone();
        let source = cfg.source;
        let id = self.push_node(dataset, StepKind::DeltaLakeLoader(cfg));
        self.add_edge(source, id)?;
        Ok(id)
    }

    /// Point a comparison step at its comparison dataset (typically the
    /// target table, which is only registered after the comparison).
    pub fn set_comparison_table(
        &mut self,
        comparison: StepId,
        target: StepId,
    ) -> Result<(), DuckFlowError> {
        self.check(comparison)?;
        self.check(target)?;
        match &mut self.nodes[comparison.0].step {
            StepKind::Comparison(cfg) => {
                cfg.comparison = Some(target);
                Ok(())
            }
            _ => Err(DuckFlowError::Configuration(format!(
                "step '{}' is not a comparison",
                self.nodes[comparison.0].dataset.name
            ))),
        }
    }

    /// Re-wire a comparison's source dataset between runs.
    pub fn set_source(&mut self, comparison: StepId, source: StepId) -> Result<(), DuckFlowError> {
        self.check(comparison)?;
        self.check(source)?;
        let old = match &self.nodes[comparison.0].step {
            StepKind::Comparison(cfg) => cfg.source,
            _ => {
                return Err(DuckFlowError::Configuration(format!(
                    "step '{}' is not a comparison",
                    self.nodes[comparison.0].dataset.name
                )))
            }
        };
        self.nodes[old.0].outputs.retain(|o| *o != comparison);
        self.nodes[comparison.0].inputs.retain(|i| *i != old);
        self.add_edge(source, comparison)?;
        match &mut self.nodes[comparison.0].step {
            StepKind::Comparison(cfg) => cfg.source = source,
            _ => unreachable!(),
        }
        Ok(())
    }

    // ── Edges ───────────────────────────────────────────────────────────

    /// Add a symmetric edge. Rejects edges that would close a cycle.
    fn add_edge(&mut self, from: StepId, to: StepId) -> Result<(), DuckFlowError> {
        if from == to || self.reaches(to, from) {
            return Err(DuckFlowError::CycleDetected(vec![
                self.nodes[from.0].dataset.name.clone(),
                self.nodes[to.0].dataset.name.clone(),
                self.nodes[from.0].dataset.name.clone(),
            ]));
        }
        if !self.nodes[from.0].outputs.contains(&to) {
            self.nodes[from.0].outputs.push(to);
        }
        if !self.nodes[to.0].inputs.contains(&from) {
            self.nodes[to.0].inputs.push(from);
        }
        Ok(())
    }

    /// DFS reachability over output edges.
    fn reaches(&self, from: StepId, target: StepId) -> bool {
        let mut stack = vec![from];
        let mut visited = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if visited[id.0] {
                continue;
            }
            visited[id.0] = true;
            stack.extend(self.nodes[id.0].outputs.iter().copied());
        }
        false
    }

    fn check(&self, id: StepId) -> Result<(), DuckFlowError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(DuckFlowError::UnknownStep(format!("step #{}", id.0)))
        }
    }

    // ── Dataset resolution ──────────────────────────────────────────────

    /// Whether the dataset carries CDC information; synonyms delegate.
    pub fn is_cdc(&self, id: StepId) -> bool {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Synonym { of } => self.is_cdc(*of),
            _ => self.nodes[id.0].dataset.is_cdc,
        }
    }

    /// Whether the dataset is backed by a persisted table.
    pub fn is_persisted(&self, id: StepId) -> bool {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { .. } => true,
            DatasetKind::Query { .. } => false,
            DatasetKind::Synonym { of } => self.is_persisted(*of),
        }
    }

    /// Physical table name of a persisted dataset; synonyms delegate.
    pub fn table_name(&self, id: StepId) -> Option<String> {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { table_name } => Some(table_name.clone()),
            DatasetKind::Query { .. } => None,
            DatasetKind::Synonym { of } => self.table_name(*of),
        }
    }

    pub fn step_name(&self, id: StepId) -> &str {
        &self.nodes[id.0].dataset.name
    }

    /// Declared logical primary key (no engine lookup); synonyms delegate.
    pub fn declared_pk(&self, id: StepId) -> Option<Vec<String>> {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Synonym { of } => self.declared_pk(*of),
            _ => self.nodes[id.0].dataset.pk_list.clone(),
        }
    }

    /// Set the logical primary key; synonym mutations route to the wrapped
    /// table.
    pub fn set_pk<I, S>(&mut self, id: StepId, pk_list: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.nodes[id.0].dataset.kind {
            DatasetKind::Synonym { of } => self.set_pk(of, pk_list),
            _ => {
                self.nodes[id.0].dataset.pk_list =
                    Some(pk_list.into_iter().map(Into::into).collect())
            }
        }
    }

    /// Primary key with catalog fallback: the declared key wins, else the
    /// engine catalog is consulted for persisted tables and the result is
    /// cached.
    pub fn table_primary_key(
        &mut self,
        engine: &dyn Engine,
        id: StepId,
    ) -> Result<Option<Vec<String>>, DuckFlowError> {
        if let DatasetKind::Synonym { of } = self.nodes[id.0].dataset.kind {
            return self.table_primary_key(engine, of);
        }
        if let Some(pk) = &self.nodes[id.0].dataset.pk_list {
            return Ok(Some(pk.clone()));
        }
        if let DatasetKind::Table { table_name } = &self.nodes[id.0].dataset.kind {
            let pk = engine.primary_key(table_name)?;
            if pk.is_some() {
                self.nodes[id.0].dataset.pk_list = pk.clone();
            }
            return Ok(pk);
        }
        Ok(None)
    }

    /// Parenthesised sub-select materialising the dataset's rows.
    pub fn sub_select(&self, id: StepId) -> Result<String, DuckFlowError> {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { table_name } => {
                Ok(format!("(select * from {})", quote_ident(table_name)))
            }
            DatasetKind::Synonym { of } => self.sub_select(*of),
            DatasetKind::Query { sql, inputs } => {
                let mut resolved = sql.clone();
                for (name, input) in inputs {
                    let clause = self.sub_select(*input)?;
                    resolved = resolved.replace(&format!("{{{name}}}"), &clause);
                }
                Ok(format!("({resolved})"))
            }
        }
    }

    /// Dataset schema. Resolution order: cached schema, then the engine
    /// catalog for persisted tables, then the Arrow schema of the
    /// sub-select. The result is cached on the node.
    pub fn schema_of(
        &mut self,
        engine: &dyn Engine,
        id: StepId,
    ) -> Result<TableSchema, DuckFlowError> {
        if let DatasetKind::Synonym { of } = self.nodes[id.0].dataset.kind {
            return self.schema_of(engine, of);
        }
        if let Some(schema) = &self.nodes[id.0].dataset.schema {
            return Ok(schema.clone());
        }
        let schema = match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { table_name } => {
                TableSchema::from_columns(engine.catalog_columns(table_name)?)
            }
            _ => {
                let sub = self.sub_select(id)?;
                engine.query_schema(&format!("with source as {sub} select * from source"))?
            }
        };
        self.nodes[id.0].dataset.schema = Some(schema.clone());
        Ok(schema)
    }

    /// Column names of the dataset, in declaration order.
    pub fn cols(
        &mut self,
        engine: &dyn Engine,
        id: StepId,
    ) -> Result<IndexSet<String>, DuckFlowError> {
        Ok(self
            .schema_of(engine, id)?
            .names()
            .map(str::to_string)
            .collect())
    }

    /// Drop the cached schema so the next resolution re-reads the engine.
    pub(crate) fn invalidate_schema(&mut self, id: StepId) {
        if let DatasetKind::Synonym { of } = self.nodes[id.0].dataset.kind {
            return self.invalidate_schema(of);
        }
        self.nodes[id.0].dataset.schema = None;
    }

    // ── Schema accumulation ─────────────────────────────────────────────

    /// Copy the source dataset's column definitions into a table's pending
    /// schema. Table sources go through the catalog (preserving
    /// nullability and decimal precision/scale), queries through the Arrow
    /// schema of their sub-select.
    pub fn add_all_columns(
        &mut self,
        engine: &dyn Engine,
        target: StepId,
        source: StepId,
    ) -> Result<(), DuckFlowError> {
        self.ensure_own_table(target)?;
        let source_schema = self.schema_of(engine, source)?;
        match &mut self.nodes[target.0].dataset.schema {
            Some(schema) => schema.merge(&source_schema),
            none => *none = Some(source_schema),
        }
        Ok(())
    }

    /// Append a column to a table's pending schema; synonym mutations route
    /// to the wrapped table.
    pub fn append_column(&mut self, id: StepId, column: Column) -> Result<(), DuckFlowError> {
        if let DatasetKind::Synonym { of } = self.nodes[id.0].dataset.kind {
            return self.append_column(of, column);
        }
        self.nodes[id.0]
            .dataset
            .schema
            .get_or_insert_with(TableSchema::new)
            .add_column(column)
    }

    /// Materialise a table's accumulated schema, attaching the primary key
    /// constraint when one is declared. Replaces any same-named table.
    pub fn create_table(&mut self, engine: &dyn Engine, id: StepId) -> Result<(), DuckFlowError> {
        self.ensure_own_table(id)?;
        let table_name = match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { table_name } => table_name.clone(),
            _ => unreachable!(),
        };
        let dataset = &self.nodes[id.0].dataset;
        let schema = dataset.schema.as_ref().ok_or_else(|| {
            DuckFlowError::Schema(format!(
                "cannot create table '{table_name}' without columns - add some first"
            ))
        })?;
        let sql = schema.create_table_sql(&table_name, dataset.pk_list.as_deref())?;
        engine.execute(&sql, &[])
    }

    /// Steps seeding default columns (SCD2 dates, surrogate keys, the CDC
    /// marker) do so through this dispatcher; `target` is the table whose
    /// pending schema receives the columns.
    pub fn add_default_columns(
        &mut self,
        step: StepId,
        target: StepId,
    ) -> Result<(), DuckFlowError> {
        self.check(step)?;
        self.check(target)?;
        let kind = self.nodes[step.0].step.clone();
        match kind {
            StepKind::Scd2(cfg) => crate::scd2::add_default_columns(self, &cfg, target),
            StepKind::GenerateKey(cfg) => crate::keygen::add_default_columns(self, &cfg, target),
            StepKind::TableLoader(cfg) => crate::load::add_default_columns(
                self,
                target,
                cfg.generated_key_column.as_deref(),
                cfg.is_cdc,
            ),
            StepKind::DeltaLakeLoader(cfg) => crate::load::add_default_columns(
                self,
                target,
                cfg.generated_key_column.as_deref(),
                cfg.is_cdc,
            ),
            _ => Err(DuckFlowError::Configuration(format!(
                "step '{}' has no default columns",
                self.nodes[step.0].dataset.name
            ))),
        }
    }

    fn ensure_own_table(&self, id: StepId) -> Result<(), DuckFlowError> {
        match &self.nodes[id.0].dataset.kind {
            DatasetKind::Table { .. } => Ok(()),
            DatasetKind::Synonym { of } => Err(DuckFlowError::Schema(format!(
                "'{}' is a synonym for '{}'",
                self.nodes[id.0].dataset.name,
                self.nodes[of.0].dataset.name
            ))),
            DatasetKind::Query { .. } => Err(DuckFlowError::Schema(format!(
                "'{}' is a query, not a persisted table",
                self.nodes[id.0].dataset.name
            ))),
        }
    }

    // ── Presentation ────────────────────────────────────────────────────

    /// Restrict the columns returned by [`Dataflow::show_data`].
    pub fn set_show_columns<I, S>(&mut self, id: StepId, cols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes[id.0].dataset.show_projection =
            Some(cols.into_iter().map(Into::into).collect());
    }

    /// Filter the rows returned by [`Dataflow::show_data`] (raw SQL).
    pub fn set_show_where(&mut self, id: StepId, clause: impl Into<String>) {
        self.nodes[id.0].dataset.show_where = Some(clause.into());
    }

    fn show_sql(&self, id: StepId) -> Result<String, DuckFlowError> {
        let dataset = &self.nodes[id.0].dataset;
        let projection = dataset
            .show_projection
            .as_ref()
            .map(|cols| col_list(cols))
            .unwrap_or_else(|| "*".to_string());
        let filter = dataset
            .show_where
            .as_ref()
            .map(|w| format!(" where {w}"))
            .unwrap_or_default();
        Ok(format!(
            "with tab as {} select {projection} from tab{filter}",
            self.sub_select(id)?
        ))
    }

    /// Fetch the dataset's rows under its presentation settings.
    pub fn show_data(
        &self,
        engine: &dyn Engine,
        id: StepId,
    ) -> Result<Vec<Vec<SqlValue>>, DuckFlowError> {
        engine.fetch(&self.show_sql(id)?, &[])
    }

    /// Log the dataset's rows at INFO, one line per row.
    pub fn show(
        &self,
        engine: &dyn Engine,
        id: StepId,
        heading: Option<&str>,
    ) -> Result<(), DuckFlowError> {
        if let Some(heading) = heading {
            info!("{heading}");
        }
        for row in self.show_data(engine, id)? {
            let line = row
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" | ");
            info!(step = %self.nodes[id.0].dataset.name, "{line}");
        }
        Ok(())
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Start graph execution from this node: pull unexecuted inputs,
    /// execute once, push into unexecuted outputs.
    pub fn start(&mut self, engine: &dyn Engine, id: StepId) -> Result<(), DuckFlowError> {
        self.check(id)?;
        self.nodes[id.0].execute_lock = true;
        if !self.nodes[id.0].executed {
            let inputs = self.nodes[id.0].inputs.clone();
            for input in inputs {
                if !self.nodes[input.0].executed && !self.nodes[input.0].execute_lock {
                    self.start(engine, input)?;
                }
            }
            self.execute_step(engine, id)?;
            self.nodes[id.0].executed = true;
        }
        let outputs = self.nodes[id.0].outputs.clone();
        for output in outputs {
            if !self.nodes[output.0].executed && !self.nodes[output.0].execute_lock {
                self.start(engine, output)?;
            }
        }
        Ok(())
    }

    fn execute_step(&mut self, engine: &dyn Engine, id: StepId) -> Result<(), DuckFlowError> {
        if matches!(self.nodes[id.0].step, StepKind::Source) {
            return Ok(());
        }
        let name = self.nodes[id.0].dataset.name.clone();
        info!(step = %name, "step started");
        let mut meta = OperationalMetadata::started();
        let step = self.nodes[id.0].step.clone();
        let rows = match &step {
            StepKind::Source => unreachable!(),
            StepKind::Comparison(cfg) => crate::compare::run(self, engine, id, cfg),
            StepKind::Scd2(cfg) => crate::scd2::run(self, engine, id, cfg),
            StepKind::GenerateKey(cfg) => crate::keygen::run(self, engine, id, cfg),
            StepKind::CdcOperation(cfg) => crate::cdc::run(self, engine, id, cfg),
            StepKind::TableLoader(cfg) => crate::load::run_table(self, engine, id, cfg),
            StepKind::DeltaLakeLoader(cfg) => crate::load::run_delta(self, engine, id, cfg),
        }
        .map_err(|e| DuckFlowError::StepFailed {
            step: name.clone(),
            source: Box::new(e),
        })?;
        meta.processed(rows);
        info!(step = %name, metrics = %meta, "step completed");
        self.nodes[id.0].last_execution = Some(meta);
        Ok(())
    }

    /// Reset `executed` and `execute_lock` across the connected component
    /// so the graph can be re-run.
    pub fn completed(&mut self, id: StepId) -> Result<(), DuckFlowError> {
        self.check(id)?;
        let mut visited = vec![false; self.nodes.len()];
        self.reset_component(id, &mut visited);
        Ok(())
    }

    fn reset_component(&mut self, id: StepId, visited: &mut [bool]) {
        if visited[id.0] {
            return;
        }
        visited[id.0] = true;
        let inputs = self.nodes[id.0].inputs.clone();
        for input in inputs {
            self.reset_component(input, visited);
        }
        self.nodes[id.0].executed = false;
        self.nodes[id.0].execute_lock = false;
        let outputs = self.nodes[id.0].outputs.clone();
        for output in outputs {
            self.reset_component(output, visited);
        }
    }

    /// Reset every node of the dataflow.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.executed = false;
            node.execute_lock = false;
        }
    }

    /// Run the whole dataflow from its first registered node and aggregate
    /// the rows loaded by loader steps into a run summary.
    pub fn run(&mut self, engine: &dyn Engine) -> Result<(), DuckFlowError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let mut summary = OperationalMetadata::started();
        self.start(engine, StepId(0))?;
        let rows = self
            .nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.step,
                    StepKind::TableLoader(_) | StepKind::DeltaLakeLoader(_)
                )
            })
            .filter_map(|n| n.last_execution.as_ref())
            .map(|m| m.rows_processed)
            .sum();
        summary.processed(rows);
        info!(summary = %summary, "dataflow completed");
        self.last_run = Some(summary);
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn executed(&self, id: StepId) -> bool {
        self.nodes[id.0].executed
    }

    pub fn last_execution(&self, id: StepId) -> Option<&OperationalMetadata> {
        self.nodes[id.0].last_execution.as_ref()
    }

    /// Summary of the last [`Dataflow::run`].
    pub fn last_run(&self) -> Option<&OperationalMetadata> {
        self.last_run.as_ref()
    }

    /// Per-step execution report as JSON.
    pub fn execution_report(&self) -> serde_json::Value {
        let report: Vec<StepReport<'_>> = self
            .nodes
            .iter()
            .map(|n| StepReport {
                step: &n.dataset.name,
                executed: n.executed,
                last_execution: n.last_execution.as_ref(),
            })
            .collect();
        serde_json::to_value(report).unwrap_or(serde_json::Value::Null)
    }

    // ── Internal node access for the step implementations ───────────────

    pub(crate) fn node(&self, id: StepId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: StepId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}
