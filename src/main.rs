//! A thin REPL/TCP driver in front of [`btreedb::engine::Engine`] (spec
//! §6.3). Line editing, SQL-ish parsing and the wire format below are
//! explicitly NOT part of the storage engine — they exist only so this
//! binary has something to type at it.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpListener;

use log::{info, warn};

use btreedb::catalog::TableInfo;
use btreedb::engine::{Engine, Join, Request, Response, WhereClause};
use btreedb::error::DbError;
use btreedb::storage::row::{ColumnType, Value};

const DATABASE_FILE: &str = "data.btreedb";

fn main() -> io::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if let Some(port) = server_port(&args) {
        return run_server(port);
    }

    let engine = Engine::open(DATABASE_FILE)?;
    run_repl(engine, &mut io::stdin().lock(), &mut io::stdout())
}

fn server_port(args: &[String]) -> Option<u16> {
    let idx = args.iter().position(|a| a == "--server")?;
    args.get(idx + 1)?.parse().ok()
}

fn run_server(port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    info!("listening on 127.0.0.1:{port}");
    for stream in listener.incoming() {
        let mut stream = stream?;
        let engine = Engine::open(DATABASE_FILE)?;
        let peer = stream.peer_addr().ok();
        info!("client connected: {peer:?}");
        let reader = stream.try_clone()?;
        if let Err(e) = serve_one_client(engine, &mut io::BufReader::new(reader), &mut stream) {
            warn!("client session ended with error: {e}");
        }
    }
    Ok(())
}

fn serve_one_client<R: Read, W: Write>(mut engine: Engine, reader: &mut io::BufReader<R>, writer: &mut W) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let response = handle_line(&mut engine, line.trim());
        writeln!(writer, "{response}")?;
        writer.flush()?;
    }
    engine.close();
    Ok(())
}

fn run_repl<R: BufRead, W: Write>(mut engine: Engine, input: &mut R, output: &mut W) -> io::Result<()> {
    info!("btreedb. Type .exit to quit.");
    loop {
        write!(output, "db > ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == ".exit" {
            break;
        }

        let response = handle_line(&mut engine, trimmed);
        writeln!(output, "{response}")?;
    }
    engine.close();
    info!("goodbye");
    Ok(())
}

/// Dispatches one line of input: meta-commands first, then the tiny
/// statement parser below, then the executor.
fn handle_line(engine: &mut Engine, line: &str) -> String {
    if line == ".tables" {
        return format_tables(engine);
    }
    if let Some(name) = line.strip_prefix(".schema ") {
        return format_schema(engine, name.trim());
    }

    match parse_statement(line) {
        Ok(request) => match engine.execute(request) {
            Ok(response) => format_response(&response),
            Err(e) => format_error(&e),
        },
        Err(msg) => msg,
    }
}

fn format_tables(engine: &Engine) -> String {
    engine.catalog().table_names().join("\n")
}

fn format_schema(engine: &Engine, name: &str) -> String {
    match engine.catalog().table(name) {
        Ok(info) => describe_columns(info),
        Err(e) => format_error(&e),
    }
}

fn describe_columns(info: &TableInfo) -> String {
    info.schema
        .columns
        .iter()
        .map(|c| match c.col_type {
            ColumnType::Int => format!("{} integer", c.name),
            ColumnType::Char(n) => format!("{} varchar({n})", c.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_response(response: &Response) -> String {
    match response {
        Response::Success => "Success".to_string(),
        Response::Rows(rows) => {
            if rows.is_empty() {
                "(0 rows)".to_string()
            } else {
                rows.iter().map(|row| format_row(row)).collect::<Vec<_>>().join("\n")
            }
        }
        Response::Tables(names) => names.join("\n"),
        Response::TableSchema(columns) => columns
            .iter()
            .map(|(name, t)| match t {
                ColumnType::Int => format!("{name} integer"),
                ColumnType::Char(n) => format!("{name} varchar({n})"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Response::IndexInfo { table, column, root_page } => {
            format!("index on {table}.{column} (root page {root_page})")
        }
    }
}

fn format_row(row: &[Value]) -> String {
    let fields: Vec<String> = row
        .iter()
        .map(|v| match v {
            Value::Int(n) => n.to_string(),
            Value::Text(s) => s.clone(),
        })
        .collect();
    format!("({})", fields.join(", "))
}

fn format_error(err: &DbError) -> String {
    format!("Error: {err}")
}

/// The thin line grammar this driver understands. Deliberately minimal: no
/// precedence, no subqueries, one `where column = value` clause, one join.
/// Real SQL parsing is an explicit non-goal of the storage engine this
/// binary drives.
fn parse_statement(line: &str) -> Result<Request, String> {
    let lower = line.to_ascii_lowercase();

    if lower == "begin" {
        return Ok(Request::Begin);
    }
    if lower == "commit" {
        return Ok(Request::Commit);
    }
    if lower == "rollback" {
        return Ok(Request::Rollback);
    }

    if let Some(rest) = strip_ci(line, "create table ") {
        return parse_create_table(rest);
    }
    if let Some(rest) = strip_ci(line, "insert into ") {
        return parse_insert(rest);
    }
    if let Some(rest) = strip_ci(line, "select ") {
        return parse_select(rest);
    }
    if let Some(rest) = strip_ci(line, "delete from ") {
        return parse_delete(rest);
    }
    if let Some(rest) = strip_ci(line, "insert_as_select ") {
        return parse_insert_as_select(rest);
    }

    Err("Error: unrecognized statement".to_string())
}

fn strip_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_create_table(rest: &str) -> Result<Request, String> {
    let (name, cols) = rest.split_once('(').ok_or("Error: syntax error")?;
    let cols = cols.strip_suffix(')').ok_or("Error: syntax error")?;
    let mut columns = Vec::new();
    for field in cols.split(',') {
        let mut parts = field.trim().split_whitespace();
        let col_name = parts.next().ok_or("Error: syntax error")?.to_string();
        let type_str = parts.next().ok_or("Error: syntax error")?.to_ascii_lowercase();
        let col_type = if type_str == "integer" || type_str == "int" {
            ColumnType::Int
        } else if let Some(size) = type_str.strip_prefix("varchar(").and_then(|s| s.strip_suffix(')')) {
            ColumnType::Char(size.parse().map_err(|_| "Error: syntax error".to_string())?)
        } else if let Some(size) = type_str.strip_prefix("char(").and_then(|s| s.strip_suffix(')')) {
            ColumnType::Char(size.parse().map_err(|_| "Error: syntax error".to_string())?)
        } else {
            return Err("Error: syntax error".to_string());
        };
        columns.push((col_name, col_type));
    }
    Ok(Request::CreateTable { name: name.trim().to_string(), columns })
}

fn parse_insert(rest: &str) -> Result<Request, String> {
    let (table, tail) = split_first_word(rest.trim());
    let tail = strip_ci(tail.trim(), "values ").ok_or("Error: syntax error")?;
    let values_part = tail.trim().strip_prefix('(').and_then(|s| s.strip_suffix(')')).ok_or("Error: syntax error")?;
    let row_values = values_part.split(',').map(parse_value).collect();
    Ok(Request::Insert { table, row_values })
}

fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Value::Text(inner.to_string())
    } else if let Ok(n) = raw.parse::<u32>() {
        Value::Int(n)
    } else {
        Value::Text(raw.trim_matches('"').to_string())
    }
}

fn parse_select(rest: &str) -> Result<Request, String> {
    let rest = strip_ci(rest.trim(), "* from ").ok_or("Error: syntax error")?;
    let (table, tail) = split_first_word(rest);
    let (where_clause, join_clause) = parse_tail_clauses(tail)?;
    Ok(Request::Select { table, where_clause, join: join_clause, limit: None })
}

fn parse_delete(rest: &str) -> Result<Request, String> {
    let (table, tail) = split_first_word(rest.trim());
    let (where_clause, _) = parse_tail_clauses(tail)?;
    Ok(Request::Delete { table, where_clause })
}

fn parse_insert_as_select(rest: &str) -> Result<Request, String> {
    let rest = strip_ci(rest.trim(), "into ").ok_or("Error: syntax error")?;
    let (target, rest) = split_first_word(rest);
    let rest = strip_ci(rest.trim(), "from ").ok_or("Error: syntax error")?;
    let (source, tail) = split_first_word(rest);
    let (where_clause, _) = parse_tail_clauses(tail)?;
    Ok(Request::InsertAsSelect { target, source, where_clause })
}

fn split_first_word(s: &str) -> (String, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(idx) => (s[..idx].to_string(), s[idx..].trim()),
        None => (s.to_string(), ""),
    }
}

fn parse_tail_clauses(tail: &str) -> Result<(Option<WhereClause>, Option<Join>), String> {
    let tail = tail.trim();
    if tail.is_empty() {
        return Ok((None, None));
    }
    if let Some(rest) = strip_ci(tail, "where ") {
        let (col, op_and_val) = rest.split_once('=').ok_or("Error: syntax error")?;
        let value = parse_value(op_and_val);
        return Ok((Some(WhereClause { column: col.trim().to_string(), value }), None));
    }
    if let Some(rest) = strip_ci(tail, "join ") {
        let (other_table, on_clause) = rest.split_once(" on ").ok_or("Error: syntax error")?;
        let (left, right) = on_clause.split_once('=').ok_or("Error: syntax error")?;
        let (_, left_col) = split_first_word(&left.replace('.', " "));
        let (_, right_col) = split_first_word(&right.replace('.', " "));
        return Ok((
            None,
            Some(Join { table: other_table.trim().to_string(), left_column: left_col.trim().to_string(), right_column: right_col.trim().to_string() }),
        ));
    }
    Err("Error: syntax error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_engine() -> Engine {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main_test.db");
        std::mem::forget(dir);
        Engine::open(path).unwrap()
    }

    #[test]
    fn create_insert_select_round_trip() {
        let mut engine = tmp_engine();
        assert_eq!(handle_line(&mut engine, "create table t (id integer, name varchar(32))"), "Success");
        assert_eq!(handle_line(&mut engine, "insert into t values (1, 'a')"), "Success");
        assert_eq!(handle_line(&mut engine, "select * from t"), "(1, a)");
    }

    #[test]
    fn select_with_where_on_users() {
        let mut engine = tmp_engine();
        assert_eq!(handle_line(&mut engine, "insert into users values (5, 'alice', 'a@x')"), "Success");
        assert_eq!(handle_line(&mut engine, "select * from users where username = 'alice'"), "(5, alice, a@x)");
    }

    #[test]
    fn duplicate_insert_reports_error() {
        let mut engine = tmp_engine();
        handle_line(&mut engine, "insert into users values (2, 'a', 'a@x')");
        let response = handle_line(&mut engine, "insert into users values (2, 'b', 'b@x')");
        assert!(response.starts_with("Error:"));
    }
}
