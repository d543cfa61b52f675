use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq)]
pub enum BookingQuery {
    All,
    ById(Ulid),
    ByTable(Ulid),
    ByEmail(String),
    InRange { from: Ms, to: Ms },
    Today,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTable {
        spec: TableSpec,
    },
    UpdateTable {
        id: Ulid,
        changes: TableChanges,
    },
    DeleteTable {
        id: Ulid,
    },
    SelectTables {
        filter: TableFilter,
    },
    InsertBooking {
        request: BookingRequest,
    },
    UpdateBooking {
        id: Ulid,
        changes: BookingChanges,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        query: BookingQuery,
    },
    SelectAvailableTables {
        min_capacity: u32,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectBookingStats {
        from: Ms,
        to: Ms,
    },
    SelectTopTables {
        from: Ms,
        to: Ms,
        limit: usize,
    },
    SelectCancelledCount {
        from: Ms,
        to: Ms,
    },
}

const DEFAULT_TOP_TABLES: usize = 10;

fn parser_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed == ";" {
        return Err(SqlError::Empty);
    }
    if trimmed.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("UPDATE ")) {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(parser_err)?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match table.as_str() {
        "tables" => {
            let mut spec = TableSpec::new(0, 0, false);
            for (col, expr) in &row {
                match col.as_str() {
                    "table_number" => spec.table_number = parse_u32(expr)?,
                    "capacity" => spec.capacity = parse_u32(expr)?,
                    "vip" => spec.vip = parse_bool(expr)?,
                    other => return Err(SqlError::UnknownColumn("tables", other.to_string())),
                }
            }
            if spec.table_number == 0 {
                return Err(SqlError::MissingColumn("table_number"));
            }
            if spec.capacity == 0 {
                return Err(SqlError::MissingColumn("capacity"));
            }
            Ok(Command::InsertTable { spec })
        }
        "bookings" => {
            let mut table_id = None;
            let mut request = BookingRequest {
                table_id: Ulid::nil(),
                start: None,
                end: None,
                customer_name: String::new(),
                customer_email: String::new(),
                customer_phone: None,
            };
            for (col, expr) in &row {
                match col.as_str() {
                    "table_id" => table_id = Some(parse_ulid_expr(expr)?),
                    "start" => request.start = parse_i64_or_null(expr)?,
                    "end" => request.end = parse_i64_or_null(expr)?,
                    "customer_name" => request.customer_name = parse_string(expr)?,
                    "customer_email" => request.customer_email = parse_string(expr)?,
                    "customer_phone" => request.customer_phone = parse_string_or_null(expr)?,
                    other => return Err(SqlError::UnknownColumn("bookings", other.to_string())),
                }
            }
            request.table_id = table_id.ok_or(SqlError::MissingColumn("table_id"))?;
            Ok(Command::InsertBooking { request })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE <table> SET col = val, ... WHERE id = '...'`, read with the
/// parser's statement-level primitives.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parser_err)?;
    parser.expect_keyword(Keyword::UPDATE).map_err(parser_err)?;
    let name = parser.parse_object_name(false).map_err(parser_err)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET).map_err(parser_err)?;
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parser_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parser_err)?)
    } else {
        None
    };
    let id = extract_where_id(&selection)?;

    let mut columns = Vec::with_capacity(assignments.len());
    for a in &assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            _ => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        columns.push((col, &a.value));
    }

    match table.as_str() {
        "tables" => {
            let mut changes = TableChanges::default();
            for (col, expr) in columns {
                match col.as_str() {
                    "table_number" => changes.table_number = Some(parse_u32(expr)?),
                    "capacity" => changes.capacity = Some(parse_u32(expr)?),
                    "vip" => changes.vip = Some(parse_bool(expr)?),
                    other => return Err(SqlError::UnknownColumn("tables", other.to_string())),
                }
            }
            Ok(Command::UpdateTable { id, changes })
        }
        "bookings" => {
            let mut changes = BookingChanges::default();
            for (col, expr) in columns {
                match col.as_str() {
                    "table_id" => changes.table_id = Some(parse_ulid_expr(expr)?),
                    "start" => changes.start = Some(parse_i64_expr(expr)?),
                    "end" => changes.end = Some(parse_i64_expr(expr)?),
                    "customer_name" => changes.customer_name = Some(parse_string(expr)?),
                    "customer_email" => changes.customer_email = Some(parse_string(expr)?),
                    "customer_phone" => changes.customer_phone = Some(parse_string_or_null(expr)?),
                    "status" => {
                        let s = parse_string(expr)?;
                        changes.status = Some(s.parse().map_err(SqlError::Parse)?);
                    }
                    other => return Err(SqlError::UnknownColumn("bookings", other.to_string())),
                }
            }
            Ok(Command::UpdateBooking { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "tables" => Ok(Command::DeleteTable { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One `column <op> value` leaf of an AND-only WHERE clause.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Predicate { column, op: op.clone(), value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_predicate<'p, 'a>(preds: &'p [Predicate<'a>], column: &str, op: BinaryOperator) -> Option<&'p Predicate<'a>> {
    preds.iter().find(|p| p.column == column && p.op == op)
}

/// `start >= a AND "end" <= b`, both required.
fn range_filter(preds: &[Predicate<'_>]) -> Result<(Ms, Ms), SqlError> {
    let from = find_predicate(preds, "start", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start"))?;
    let to = find_predicate(preds, "end", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end"))?;
    Ok((parse_i64_expr(from.value)?, parse_i64_expr(to.value)?))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }

    match table.as_str() {
        "tables" => {
            let mut filter = TableFilter::default();
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("vip", BinaryOperator::Eq) => filter.vip_only = parse_bool(p.value)?,
                    ("capacity", BinaryOperator::GtEq) => filter.min_capacity = Some(parse_u32(p.value)?),
                    (col, _) => return Err(SqlError::Unsupported(format!("tables filter on {col}"))),
                }
            }
            Ok(Command::SelectTables { filter })
        }
        "bookings" => {
            let query = if let Some(p) = find_predicate(&preds, "id", BinaryOperator::Eq) {
                BookingQuery::ById(parse_ulid_expr(p.value)?)
            } else if let Some(p) = find_predicate(&preds, "table_id", BinaryOperator::Eq) {
                BookingQuery::ByTable(parse_ulid_expr(p.value)?)
            } else if let Some(p) = find_predicate(&preds, "customer_email", BinaryOperator::Eq) {
                BookingQuery::ByEmail(parse_string(p.value)?)
            } else if preds.is_empty() {
                BookingQuery::All
            } else {
                let (from, to) = range_filter(&preds)?;
                BookingQuery::InRange { from, to }
            };
            Ok(Command::SelectBookings { query })
        }
        "today_bookings" => Ok(Command::SelectBookings { query: BookingQuery::Today }),
        "available_tables" => {
            let min_capacity = match find_predicate(&preds, "capacity", BinaryOperator::GtEq) {
                Some(p) => parse_u32(p.value)?,
                None => 1,
            };
            let start = find_predicate(&preds, "start", BinaryOperator::Eq)
                .map(|p| parse_i64_or_null(p.value))
                .transpose()?
                .flatten();
            let end = find_predicate(&preds, "end", BinaryOperator::Eq)
                .map(|p| parse_i64_or_null(p.value))
                .transpose()?
                .flatten();
            Ok(Command::SelectAvailableTables { min_capacity, start, end })
        }
        "booking_stats" => {
            let (from, to) = range_filter(&preds)?;
            Ok(Command::SelectBookingStats { from, to })
        }
        "top_tables" => {
            let (from, to) = range_filter(&preds)?;
            let limit = match find_predicate(&preds, "n", BinaryOperator::LtEq) {
                Some(p) => parse_u32(p.value)? as usize,
                None => DEFAULT_TOP_TABLES,
            };
            Ok(Command::SelectTopTables { from, to, limit })
        }
        "cancelled_count" => {
            let (from, to) = range_filter(&preds)?;
            Ok(Command::SelectCancelledCount { from, to })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "tables" => &["table_number", "capacity", "vip"],
        "bookings" => &["table_id", "start", "end", "customer_name", "customer_email", "customer_phone"],
        _ => &[],
    }
}

/// Single VALUES row zipped with its column names. Without a column list the
/// table's declared column order applies.
fn insert_row(insert: &ast::Insert, table: &str) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_string(expr)?)),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => write!(f, "expected {expected} values, got {got}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
