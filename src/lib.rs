//! duckflow: CDC and SCD2 dataflow pipelines over an embedded analytic
//! SQL engine.
//!
//! The library expresses change-data-capture and slowly-changing-dimension
//! type-2 pipelines as a DAG of typed steps executed against a columnar,
//! single-process SQL engine. Given a source dataset (a table or a
//! parameterised query) and a target dimension table, it computes the
//! row-level delta against the target, tags each delta row with a change
//! type (insert / update / before image / delete), optionally converts the
//! delta into SCD2 versioning rows, assigns surrogate keys, and applies
//! the result to a local table or a lakehouse table.
//!
//! # Architecture
//!
//! - [`graph::Dataflow`] — the step graph: symmetric edges, cycle
//!   detection, topological one-shot execution with explicit reset.
//! - [`dataset`] — the dataset model: persisted tables, parameterised
//!   queries, and synonyms (in-place transforms sharing an upstream
//!   table's storage).
//! - [`compare::Comparison`] — the delta engine producing the `I`/`U`/
//!   `B`/`D` CDC stream from a source and a (possibly SCD2-versioned)
//!   comparison table.
//! - [`scd2::Scd2`], [`keygen::GenerateKey`], [`cdc::CdcOperation`] —
//!   in-place transforms over the CDC table.
//! - [`load::TableLoader`], [`load::DeltaLakeLoader`] — appliers merging
//!   the stream into the persistent target.
//! - [`engine::Engine`] — the narrow adapter below the SQL layer; the
//!   DuckDB binding lives behind the `duckdb` feature.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "duckdb")]
//! # fn pipeline() -> Result<(), duckflow::DuckFlowError> {
//! use duckflow::{
//!     Comparison, Dataflow, DuckDbEngine, GenerateKey, Scd2, StartValue, Table, TableLoader,
//! };
//!
//! let engine = DuckDbEngine::open_in_memory()?;
//! let mut flow = Dataflow::new();
//! let customer = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
//! let delta = flow.add_comparison(
//!     Comparison::new(customer)
//!         .detect_deletes(true)
//!         .end_date_column("end_date"),
//! )?;
//! let versions = flow.add_scd2(
//!     Scd2::new(delta, "start_date", "end_date").current_flag_column("current"),
//! )?;
//! let target = flow.add_table(Table::new("dim", "customer_dim"));
//! let keys = flow.add_generate_key(
//!     GenerateKey::new(versions, StartValue::MaxOf(target)).surrogate_key_column("version_id"),
//! )?;
//! flow.add_table_loader(TableLoader::new(keys, "customer_dim"))?;
//! flow.set_comparison_table(delta, target)?;
//!
//! flow.add_all_columns(&engine, target, customer)?;
//! flow.add_default_columns(versions, target)?;
//! flow.add_default_columns(keys, target)?;
//! flow.create_table(&engine, target)?;
//!
//! flow.run(&engine)?;
//! # Ok(())
//! # }
//! ```

pub mod cdc;
pub mod compare;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod graph;
pub mod keygen;
pub mod load;
pub mod metrics;
pub mod scd2;
pub mod schema;
pub mod sql;

pub use cdc::{CdcOperation, RowType, CHANGE_TYPE};
pub use compare::Comparison;
pub use dataset::{Query, Table};
pub use engine::{Engine, LakehouseOp, MergeAssignments, MergeSpec, SqlValue};
pub use error::{DuckFlowError, ErrorKind};
pub use graph::{Dataflow, StepId};
pub use keygen::{GenerateKey, StartValue};
pub use load::{DeltaLakeLoader, TableLoader};
pub use metrics::OperationalMetadata;
pub use scd2::Scd2;
pub use schema::{Column, LogicalType, TableSchema};

#[cfg(feature = "duckdb")]
pub use engine::duckdb::DuckDbEngine;
