//! End-to-end pipeline scenarios against an in-memory DuckDB.
//!
//! These exercise the full dataflow (comparison, SCD2 conversion, key
//! generation, load) across repeated runs with changing source data:
//! - three-run SCD2 lifecycle with an update, a delete, and a
//!   delete-then-reappear key
//! - identity-run idempotence (empty delta, target unchanged)
//! - upsert-only loading without CDC
//! - active-version filtering via the end-date column
//! - stability under ignored columns
#![cfg(feature = "duckdb")]

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use duckflow::{
    Comparison, Dataflow, DuckDbEngine, Engine, GenerateKey, Scd2, SqlValue, StartValue, StepId,
    Table, TableLoader,
};
use test_log::test;

fn termination() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn replace_customers(engine: &DuckDbEngine, rows: &[(&str, &str)]) {
    engine.execute("delete from customer", &[]).unwrap();
    for (id, name) in rows {
        engine
            .execute(
                "insert into customer values ($1, $2)",
                &[SqlValue::from(*id), SqlValue::from(*name)],
            )
            .unwrap();
    }
}

struct Pipeline {
    flow: Dataflow,
    comparison: StepId,
}

/// customer → comparison → scd2 → generate key → customer_dim.
fn scd2_pipeline(engine: &DuckDbEngine) -> Pipeline {
    engine
        .execute(
            "create table customer(\"Customer Id\" varchar, \"First Name\" varchar)",
            &[],
        )
        .unwrap();

    let mut flow = Dataflow::new();
    let customer = flow.add_table(Table::new("customer", "customer").pk(["Customer Id"]));
    let comparison = flow
        .add_comparison(
            Comparison::new(customer)
                .detect_deletes(true)
                .end_date_column("end_date")
                .order_column("version_id"),
        )
        .unwrap();
    let versions = flow
        .add_scd2(Scd2::new(comparison, "start_date", "end_date").current_flag_column("current"))
        .unwrap();
    let target = flow.add_table(Table::new("dim", "customer_dim"));
    let keys = flow
        .add_generate_key(
            GenerateKey::new(versions, StartValue::MaxOf(target))
                .surrogate_key_column("version_id"),
        )
        .unwrap();
    flow.add_table_loader(TableLoader::new(keys, "customer_dim"))
        .unwrap();
    flow.set_comparison_table(comparison, target).unwrap();

    flow.add_all_columns(engine, target, customer).unwrap();
    flow.add_default_columns(versions, target).unwrap();
    flow.add_default_columns(keys, target).unwrap();
    flow.create_table(engine, target).unwrap();

    Pipeline { flow, comparison }
}

/// `(Customer Id, First Name, current, end-is-termination)` per row.
fn dim_rows(engine: &DuckDbEngine) -> Vec<(String, String, String, bool)> {
    engine
        .fetch(
            "select \"Customer Id\", \"First Name\", \"current\", \"end_date\" \
             from customer_dim",
            &[],
        )
        .unwrap()
        .into_iter()
        .map(|row| {
            (
                row[0].as_str().unwrap().to_string(),
                row[1].as_str().unwrap().to_string(),
                row[2].as_str().unwrap().to_string(),
                row[3].as_timestamp().unwrap() == termination(),
            )
        })
        .collect()
}

fn change_types(engine: &DuckDbEngine) -> Vec<String> {
    engine
        .fetch(
            "select \"__change_type\" from customer_tc order by \"__change_type\"",
            &[],
        )
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_scd2_lifecycle_across_three_runs() {
    let engine = DuckDbEngine::open_in_memory().unwrap();
    let Pipeline {
        mut flow,
        comparison,
    } = scd2_pipeline(&engine);

    // Run 1: two new customers into an empty target.
    replace_customers(
        &engine,
        &[("56b3cEA1E6A49F1", "Barry"), ("eF43a70995dabAB", "Terrance")],
    );
    flow.run(&engine).unwrap();

    let rows = dim_rows(&engine);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|(_, _, current, active)| current == "Y" && *active));
    let keys: HashSet<i64> = engine
        .fetch("select \"version_id\" from customer_dim", &[])
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_i64().unwrap())
        .collect();
    assert_eq!(keys, HashSet::from([1, 2]));

    // Identity run: same source again, the delta is empty and the target
    // does not change.
    flow.completed(comparison).unwrap();
    flow.run(&engine).unwrap();
    assert_eq!(flow.last_execution(comparison).unwrap().rows_processed, 0);
    assert_eq!(dim_rows(&engine).len(), 2);

    // Run 2: one insert, one name change, one delete.
    flow.completed(comparison).unwrap();
    replace_customers(
        &engine,
        &[("FaE5E3c1Ea0dAf6", "Fritz"), ("56b3cEA1E6A49F1", "Berry")],
    );
    flow.run(&engine).unwrap();

    assert_eq!(change_types(&engine), vec!["B", "D", "I", "U"]);
    let rows: HashSet<_> = dim_rows(&engine).into_iter().collect();
    assert_eq!(
        rows,
        HashSet::from([
            ("56b3cEA1E6A49F1".into(), "Barry".into(), "N".into(), false),
            ("eF43a70995dabAB".into(), "Terrance".into(), "N".into(), false),
            ("FaE5E3c1Ea0dAf6".into(), "Fritz".into(), "Y".into(), true),
            ("56b3cEA1E6A49F1".into(), "Berry".into(), "Y".into(), true),
        ])
    );

    // Run 3: back to the original content. The deleted key reappears as a
    // brand new version with a fresh key.
    flow.completed(comparison).unwrap();
    replace_customers(
        &engine,
        &[("56b3cEA1E6A49F1", "Barry"), ("eF43a70995dabAB", "Terrance")],
    );
    flow.run(&engine).unwrap();

    let rows = dim_rows(&engine);
    assert_eq!(rows.len(), 6);
    let actives: HashSet<_> = rows
        .iter()
        .filter(|(_, _, current, _)| current == "Y")
        .map(|(id, name, _, active)| (id.clone(), name.clone(), *active))
        .collect();
    assert_eq!(
        actives,
        HashSet::from([
            ("56b3cEA1E6A49F1".to_string(), "Barry".to_string(), true),
            ("eF43a70995dabAB".to_string(), "Terrance".to_string(), true),
        ])
    );
    assert_eq!(rows.iter().filter(|(_, _, c, _)| c == "N").count(), 4);

    // Keys never repeat across runs.
    let keys: Vec<i64> = engine
        .fetch(
            "select \"version_id\" from customer_dim order by \"version_id\"",
            &[],
        )
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_i64().unwrap())
        .collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_upsert_only_load_is_idempotent() {
    let engine = DuckDbEngine::open_in_memory().unwrap();
    engine
        .execute("create table product(id integer, name varchar)", &[])
        .unwrap();
    engine
        .execute(
            "create table product_dim(id integer primary key, name varchar)",
            &[],
        )
        .unwrap();
    engine
        .execute("insert into product values (1, 'Widget'), (2, 'Gadget')", &[])
        .unwrap();

    let mut flow = Dataflow::new();
    let product = flow.add_table(Table::new("product", "product"));
    let loader = flow
        .add_table_loader(TableLoader::new(product, "product_dim"))
        .unwrap();

    flow.run(&engine).unwrap();
    flow.completed(loader).unwrap();
    flow.run(&engine).unwrap();

    let rows = engine
        .fetch("select id, name from product_dim order by id", &[])
        .unwrap();
    assert_eq!(rows.len(), 2, "double upsert must not duplicate rows");
    assert_eq!(rows[0][1].as_str(), Some("Widget"));

    // A changed row is replaced, not duplicated.
    flow.completed(loader).unwrap();
    engine
        .execute("update product set name = 'Whatsit' where id = 1", &[])
        .unwrap();
    flow.run(&engine).unwrap();
    let rows = engine
        .fetch("select name from product_dim order by id", &[])
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0].as_str(), Some("Whatsit"));
}

#[test]
fn test_closed_history_row_yields_insert_not_update() {
    let engine = DuckDbEngine::open_in_memory().unwrap();
    let Pipeline { mut flow, .. } = scd2_pipeline(&engine);

    // The target holds only a closed historic version for the key and no
    // active row; the comparison is restricted to active versions, so the
    // source row must come back as an insert.
    engine
        .execute(
            "insert into customer_dim values \
             ('56b3cEA1E6A49F1', 'Barry', timestamp '2024-01-01 00:00:00', \
              timestamp '2024-06-01 00:00:00', 'N', 1)",
            &[],
        )
        .unwrap();
    replace_customers(&engine, &[("56b3cEA1E6A49F1", "Barry")]);
    flow.run(&engine).unwrap();

    assert_eq!(change_types(&engine), vec!["I"]);
    let rows: HashSet<_> = dim_rows(&engine).into_iter().collect();
    assert_eq!(
        rows,
        HashSet::from([
            ("56b3cEA1E6A49F1".into(), "Barry".into(), "N".into(), false),
            ("56b3cEA1E6A49F1".into(), "Barry".into(), "Y".into(), true),
        ])
    );
    // The reappeared version continues the key space.
    let keys: HashSet<i64> = engine
        .fetch("select \"version_id\" from customer_dim", &[])
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_i64().unwrap())
        .collect();
    assert_eq!(keys, HashSet::from([1, 2]));
}

#[test]
fn test_changes_in_ignored_columns_produce_no_delta() {
    let engine = DuckDbEngine::open_in_memory().unwrap();
    engine
        .execute(
            "create table item(id varchar, val varchar, change_date timestamp)",
            &[],
        )
        .unwrap();
    engine
        .execute(
            "create table item_dim(id varchar, val varchar, change_date timestamp)",
            &[],
        )
        .unwrap();
    engine
        .execute(
            "insert into item values ('a', 'x', timestamp '2026-01-02 00:00:00')",
            &[],
        )
        .unwrap();
    engine
        .execute(
            "insert into item_dim values ('a', 'x', timestamp '2026-01-01 00:00:00')",
            &[],
        )
        .unwrap();

    let mut flow = Dataflow::new();
    let item = flow.add_table(Table::new("item", "item").pk(["id"]));
    let dim = flow.add_table(Table::new("item_dim", "item_dim"));
    let comparison = flow
        .add_comparison(
            Comparison::new(item)
                .comparison(dim)
                .ignore_columns(["change_date"]),
        )
        .unwrap();
    flow.run(&engine).unwrap();

    assert_eq!(flow.last_execution(comparison).unwrap().rows_processed, 0);

    // A change in a compared column still surfaces.
    flow.completed(comparison).unwrap();
    engine
        .execute("update item set val = 'y' where id = 'a'", &[])
        .unwrap();
    flow.run(&engine).unwrap();
    let types: HashSet<String> = engine
        .fetch("select \"__change_type\" from item_tc", &[])
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types, HashSet::from(["U".to_string(), "B".to_string()]));
}
