//! End-to-end scenarios against the public `Engine` surface (spec §8
//! "Concrete end-to-end scenarios"). These exercise the pager, B+tree,
//! catalog and executor together through one file-backed database, the way
//! a real client session would.

use btreedb::engine::{Engine, Request, Response, WhereClause};
use btreedb::error::DbError;
use btreedb::storage::row::{ColumnType, Value};

fn tmp_path() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("integration.btreedb");
    std::mem::forget(dir);
    path
}

fn users_row(id: u32, username: &str, email: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Text(username.to_string()), Value::Text(email.to_string())]
}

fn insert_users(engine: &mut Engine, row: Vec<Value>) -> Result<Response, DbError> {
    engine.execute(Request::Insert { table: "users".to_string(), row_values: row })
}

fn select_all_users(engine: &mut Engine) -> Vec<Vec<Value>> {
    let Response::Rows(rows) =
        engine.execute(Request::Select { table: "users".to_string(), where_clause: None, join: None, limit: None }).unwrap()
    else {
        panic!("expected Rows");
    };
    rows
}

/// Scenario 1: fresh database, one insert, select shows it back.
#[test]
fn fresh_database_insert_then_select() {
    let mut engine = Engine::open(tmp_path()).unwrap();
    let row = users_row(1, "a", "a@x");
    assert_eq!(insert_users(&mut engine, row.clone()).unwrap(), Response::Success);

    let rows = select_all_users(&mut engine);
    assert_eq!(rows, vec![row]);
}

/// Scenario 2: 14 sequential inserts force at least one leaf split (leaf
/// capacity for the `users` row is 13), and the full scan still comes back
/// ordered 1..14.
#[test]
fn fourteen_inserts_split_and_scan_ordered() {
    let mut engine = Engine::open(tmp_path()).unwrap();
    for id in 1..=14u32 {
        let row = users_row(id, &format!("user{id}"), "x@y");
        assert_eq!(insert_users(&mut engine, row).unwrap(), Response::Success);
    }

    let rows = select_all_users(&mut engine);
    let ids: Vec<u32> = rows
        .iter()
        .map(|r| match &r[0] {
            Value::Int(v) => *v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(ids, (1..=14).collect::<Vec<_>>());
}

/// Scenario 3: a duplicate primary key is rejected and the table still only
/// holds the three originally-inserted rows.
#[test]
fn duplicate_key_rejected_leaves_table_unchanged() {
    let mut engine = Engine::open(tmp_path()).unwrap();
    for id in 1..=3u32 {
        insert_users(&mut engine, users_row(id, &format!("user{id}"), "x@y")).unwrap();
    }

    let err = insert_users(&mut engine, users_row(2, "again", "again@y")).unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey(_)));

    let rows = select_all_users(&mut engine);
    assert_eq!(rows.len(), 3);
}

/// Scenario 4: a `where username = ...` lookup on an indexed column costs
/// far fewer page accesses than a full scan of the same table, because it's
/// serviced through the secondary index rather than a linear scan.
#[test]
fn indexed_lookup_costs_fewer_page_accesses_than_full_scan() {
    let mut engine = Engine::open(tmp_path()).unwrap();
    for id in 1..=40u32 {
        insert_users(&mut engine, users_row(id, &format!("user{id}"), "x@y")).unwrap();
    }
    insert_users(&mut engine, users_row(41, "alice", "a@x")).unwrap();

    let before = engine.page_access_count();
    let resp = engine
        .execute(Request::Select {
            table: "users".to_string(),
            where_clause: Some(WhereClause { column: "username".to_string(), value: Value::Text("alice".to_string()) }),
            join: None,
            limit: None,
        })
        .unwrap();
    let indexed_accesses = engine.page_access_count() - before;
    assert_eq!(resp, Response::Rows(vec![users_row(41, "alice", "a@x")]));

    let before = engine.page_access_count();
    let _ = select_all_users(&mut engine);
    let scan_accesses = engine.page_access_count() - before;

    assert!(
        indexed_accesses < scan_accesses,
        "indexed lookup touched {indexed_accesses} pages, full scan touched {scan_accesses}"
    );
}

/// Scenario 5: `begin; insert; rollback` leaves the file byte-identical to
/// its pre-`begin` state, observed after both sessions close cleanly.
#[test]
fn begin_insert_rollback_leaves_file_byte_identical() {
    let path = tmp_path();

    let engine = Engine::open(&path).unwrap();
    engine.close();
    let before = std::fs::read(&path).unwrap();

    let mut engine = Engine::open(&path).unwrap();
    engine.execute(Request::Begin).unwrap();
    insert_users(&mut engine, users_row(42, "x", "x@y")).unwrap();
    engine.execute(Request::Rollback).unwrap();
    engine.close();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);

    let mut engine = Engine::open(&path).unwrap();
    let rows = select_all_users(&mut engine);
    assert!(rows.iter().all(|r| r[0] != Value::Int(42)));
}

/// Scenario 6: `create table`, `insert`, `select` round-trips through a
/// brand new user-defined table.
#[test]
fn create_table_insert_select_round_trip() {
    let mut engine = Engine::open(tmp_path()).unwrap();
    engine
        .execute(Request::CreateTable {
            name: "t".to_string(),
            columns: vec![("id".to_string(), ColumnType::Int), ("name".to_string(), ColumnType::Char(32))],
        })
        .unwrap();
    engine
        .execute(Request::Insert { table: "t".to_string(), row_values: vec![Value::Int(1), Value::Text("a".to_string())] })
        .unwrap();

    let Response::Rows(rows) =
        engine.execute(Request::Select { table: "t".to_string(), where_clause: None, join: None, limit: None }).unwrap()
    else {
        panic!("expected Rows");
    };
    assert_eq!(rows, vec![vec![Value::Int(1), Value::Text("a".to_string())]]);
}
