use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        id: Ulid,
        title: String,
        starts_at: Ms,
        location: String,
        close_at: Option<Ms>,
    },
    UpdateEventStatus {
        id: Ulid,
        status: EventStatus,
    },
    InsertCourt {
        id: Ulid,
        event_id: Ulid,
        name: String,
        capacity: u32,
        is_open: bool,
        sort_order: u32,
    },
    UpdateCourt {
        id: Ulid,
        patch: CourtPatch,
    },
    DeleteCourt {
        id: Ulid,
    },
    InsertCaptain {
        event_id: Ulid,
        user_id: String,
    },
    DeleteCaptain {
        event_id: Ulid,
        user_id: String,
    },
    InsertRegistration {
        id: Ulid,
        event_id: Ulid,
        court_id: Ulid,
    },
    InsertGuest {
        id: Ulid,
        event_id: Ulid,
        court_id: Ulid,
        guest_name: String,
    },
    MoveRegistration {
        id: Ulid,
        court_id: Ulid,
    },
    DeleteRegistration {
        id: Ulid,
    },
    SelectEvents {
        id: Option<Ulid>,
    },
    SelectCourts {
        event_id: Ulid,
    },
    /// Confirmed players of a whole event, or of one court.
    SelectPlayers {
        event_id: Option<Ulid>,
        court_id: Option<Ulid>,
    },
    SelectWaitlist {
        event_id: Ulid,
    },
    SelectRegistration {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = unquote(trimmed[7..].trim());
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: unquote(channel),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn unquote(channel: &str) -> String {
    channel.trim_matches('"').to_string()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "events" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("events", 4, values.len()));
            }
            Ok(Command::InsertEvent {
                id: parse_ulid(&values[0])?,
                title: parse_string(&values[1])?,
                starts_at: parse_i64(&values[2])?,
                location: parse_string(&values[3])?,
                close_at: match values.get(4) {
                    Some(v) => parse_i64_or_null(v)?,
                    None => None,
                },
            })
        }
        "courts" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("courts", 4, values.len()));
            }
            Ok(Command::InsertCourt {
                id: parse_ulid(&values[0])?,
                event_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                capacity: parse_u32(&values[3])?,
                is_open: match values.get(4) {
                    Some(v) => parse_bool(v)?,
                    None => true,
                },
                sort_order: match values.get(5) {
                    Some(v) => parse_u32(v)?,
                    None => 1,
                },
            })
        }
        "captains" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("captains", 2, values.len()));
            }
            Ok(Command::InsertCaptain {
                event_id: parse_ulid(&values[0])?,
                user_id: parse_string(&values[1])?,
            })
        }
        "registrations" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("registrations", 3, values.len()));
            }
            Ok(Command::InsertRegistration {
                id: parse_ulid(&values[0])?,
                event_id: parse_ulid(&values[1])?,
                court_id: parse_ulid(&values[2])?,
            })
        }
        "guests" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("guests", 4, values.len()));
            }
            Ok(Command::InsertGuest {
                id: parse_ulid(&values[0])?,
                event_id: parse_ulid(&values[1])?,
                court_id: parse_ulid(&values[2])?,
                guest_name: parse_string(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &assignment.value));
    }
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "events" => {
            let mut status = None;
            for (column, value) in set {
                match column.as_str() {
                    "status" => {
                        let s = parse_string(value)?;
                        status = Some(
                            EventStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                        );
                    }
                    _ => return Err(SqlError::UnknownColumn("events", column)),
                }
            }
            Ok(Command::UpdateEventStatus {
                id,
                status: status.ok_or(SqlError::MissingColumn("status"))?,
            })
        }
        "courts" => {
            let mut patch = CourtPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "sort_order" => patch.sort_order = Some(parse_u32(value)?),
                    "is_open" => patch.is_open = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("courts", column)),
                }
            }
            Ok(Command::UpdateCourt { id, patch })
        }
        "registrations" => {
            let mut court_id = None;
            for (column, value) in set {
                match column.as_str() {
                    "court_id" => court_id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnknownColumn("registrations", column)),
                }
            }
            Ok(Command::MoveRegistration {
                id,
                court_id: court_id.ok_or(SqlError::MissingColumn("court_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt {
            id: extract_where_id(&delete.selection)?,
        }),
        "registrations" => Ok(Command::DeleteRegistration {
            id: extract_where_id(&delete.selection)?,
        }),
        "captains" => {
            let filters = eq_filters(&delete.selection);
            let event_id = filter(&filters, "event_id")?;
            let user_id = filters
                .iter()
                .find(|(col, _)| col == "user_id")
                .ok_or(SqlError::MissingFilter("user_id"))?;
            Ok(Command::DeleteCaptain {
                event_id: parse_ulid(event_id)?,
                user_id: parse_string(user_id.1)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = eq_filters(&select.selection);

    match table.as_str() {
        "events" => Ok(Command::SelectEvents {
            id: match filter(&filters, "id") {
                Ok(expr) => Some(parse_ulid(expr)?),
                Err(_) => None,
            },
        }),
        "courts" => Ok(Command::SelectCourts {
            event_id: parse_ulid(filter(&filters, "event_id")?)?,
        }),
        "players" => {
            let event_id = filter(&filters, "event_id").ok().map(parse_ulid).transpose()?;
            let court_id = filter(&filters, "court_id").ok().map(parse_ulid).transpose()?;
            if event_id.is_none() && court_id.is_none() {
                return Err(SqlError::MissingFilter("event_id"));
            }
            Ok(Command::SelectPlayers { event_id, court_id })
        }
        "waitlist" => Ok(Command::SelectWaitlist {
            event_id: parse_ulid(filter(&filters, "event_id")?)?,
        }),
        "registrations" => Ok(Command::SelectRegistration {
            id: parse_ulid(filter(&filters, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of a WHERE clause joined by AND.
fn eq_filters(selection: &Option<Expr>) -> Vec<(String, &Expr)> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right));
                }
            }
            Expr::Nested(inner) => walk(inner, out),
            _ => {}
        }
    }
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out);
    }
    out
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(col, _)| col == column)
        .map(|(_, expr)| *expr)
        .ok_or(SqlError::MissingFilter(column))
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = eq_filters(selection);
    parse_ulid(filter(&filters, "id")?)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64(expr)?)),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
