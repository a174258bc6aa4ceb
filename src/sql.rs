use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertMember {
        name: String,
        role: Role,
        vacation_balance: u32,
        hour_balance: u32,
    },
    DeleteMember {
        name: String,
    },
    InsertRequest {
        id: Option<Ulid>,
        member: String,
        kind: RequestKind,
        date: NaiveDate,
        hours: u32,
        comment: Option<String>,
    },
    ApproveRequest {
        id: Ulid,
        comment: Option<String>,
    },
    RejectRequest {
        id: Ulid,
        comment: Option<String>,
    },
    DeleteRequest {
        id: Ulid,
    },
    InsertHoliday {
        id: Option<Ulid>,
        date: NaiveDate,
        label: String,
        kind: HolidayKind,
    },
    DeleteHoliday {
        id: Ulid,
    },
    /// Multi-row INSERT. Rows run in order and stop at the first failure.
    Batch(Vec<Command>),
    SelectMembers {
        name: Option<String>,
    },
    SelectRequests {
        filter: RequestFilter,
    },
    SelectHolidays,
    SelectSummary,
    SelectOverlaps,
    SelectCalendar {
        year: Option<i32>,
    },
    SelectCalendarFeed {
        year: Option<i32>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row, addressed by column name when the INSERT lists columns
/// and by position otherwise.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, name: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            self.columns
                .iter()
                .position(|c| c == name)
                .and_then(|i| self.values.get(i))
        }
    }

    fn required(&self, table: &'static str, name: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(name, position)
            .ok_or(SqlError::MissingColumn(table, name))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    let rows = extract_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::Parse(format!(
            "batch of {} rows exceeds limit of {MAX_BATCH_SIZE}",
            rows.len()
        )));
    }

    let mut commands = Vec::with_capacity(rows.len());
    for (i, values) in rows.iter().enumerate() {
        if !columns.is_empty() && values.len() != columns.len() {
            return Err(SqlError::WrongArity("VALUES row", columns.len(), values.len()));
        }
        let row = Row { columns: &columns, values };
        let cmd = parse_insert_row(&table, &row).map_err(|e| {
            if rows.len() > 1 {
                SqlError::Parse(format!("row {i}: {e}"))
            } else {
                e
            }
        })?;
        commands.push(cmd);
    }

    if commands.len() == 1 {
        Ok(commands.remove(0))
    } else {
        Ok(Command::Batch(commands))
    }
}

fn parse_insert_row(table: &str, row: &Row<'_>) -> Result<Command, SqlError> {
    match table {
        "members" => Ok(Command::UpsertMember {
            name: parse_string(row.required("members", "name", 0)?)?,
            role: parse_enum(row.required("members", "role", 1)?)?,
            vacation_balance: parse_u32(row.required("members", "vacation_balance", 2)?)?,
            hour_balance: parse_u32(row.required("members", "hour_balance", 3)?)?,
        }),
        "requests" => {
            let id = match row.get("id", 0) {
                Some(e) => parse_ulid_or_null(e)?,
                None => None,
            };
            let hours = match row.get("hours", 4) {
                Some(e) => parse_u32_or_null(e)?.unwrap_or(0),
                None => 0,
            };
            Ok(Command::InsertRequest {
                id,
                member: parse_string(row.required("requests", "member", 1)?)?,
                kind: parse_enum(row.required("requests", "kind", 2)?)?,
                date: parse_date(row.required("requests", "date", 3)?)?,
                hours,
                comment: optional_string(row.get("comment", 5))?,
            })
        }
        "approvals" => Ok(Command::ApproveRequest {
            id: parse_ulid(row.required("approvals", "request_id", 0)?)?,
            comment: optional_string(row.get("comment", 1))?,
        }),
        "rejections" => Ok(Command::RejectRequest {
            id: parse_ulid(row.required("rejections", "request_id", 0)?)?,
            comment: optional_string(row.get("comment", 1))?,
        }),
        "holidays" => {
            let id = match row.get("id", 0) {
                Some(e) => parse_ulid_or_null(e)?,
                None => None,
            };
            let kind = match row.get("kind", 3) {
                Some(e) => parse_enum_or_null(e)?.unwrap_or(HolidayKind::National),
                None => HolidayKind::National,
            };
            Ok(Command::InsertHoliday {
                id,
                date: parse_date(row.required("holidays", "date", 1)?)?,
                label: parse_string(row.required("holidays", "label", 2)?)?,
                kind,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "members" => Ok(Command::DeleteMember {
            name: parse_string(extract_where_eq(&delete.selection, "name")?)?,
        }),
        "requests" => Ok(Command::DeleteRequest {
            id: parse_ulid(extract_where_eq(&delete.selection, "id")?)?,
        }),
        "holidays" => Ok(Command::DeleteHoliday {
            id: parse_ulid(extract_where_eq(&delete.selection, "id")?)?,
        }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "members" => {
            let mut name = None;
            for (col, value) in filters {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    _ => return Err(SqlError::UnknownColumn("members", col)),
                }
            }
            Ok(Command::SelectMembers { name })
        }
        "requests" => {
            let mut filter = RequestFilter::default();
            for (col, value) in filters {
                match col.as_str() {
                    "member" => filter.member = Some(parse_string(value)?),
                    "status" => filter.status = Some(parse_enum(value)?),
                    "date" => filter.date = Some(parse_date(value)?),
                    _ => return Err(SqlError::UnknownColumn("requests", col)),
                }
            }
            Ok(Command::SelectRequests { filter })
        }
        "calendar" | "calendar_feed" => {
            let mut year = None;
            for (col, value) in filters {
                match col.as_str() {
                    "year" => year = Some(parse_i32(value)?),
                    _ => return Err(SqlError::UnknownColumn("calendar", col)),
                }
            }
            if table == "calendar" {
                Ok(Command::SelectCalendar { year })
            } else {
                Ok(Command::SelectCalendarFeed { year })
            }
        }
        "holidays" | "summary" | "overlaps" => {
            if let Some((col, _)) = filters.into_iter().next() {
                return Err(SqlError::Unsupported(format!("filter on {col} for {table}")));
            }
            Ok(match table.as_str() {
                "holidays" => Command::SelectHolidays,
                "summary" => Command::SelectSummary,
                _ => Command::SelectOverlaps,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flattens `a = x AND b = y` into `[(a, x), (b, y)]`.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The right-hand side of `WHERE <column> = value`.
fn extract_where_eq<'a>(selection: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(right.as_ref()),
        _ => Err(SqlError::MissingFilter(column)),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn optional_string(expr: Option<&Expr>) -> Result<Option<String>, SqlError> {
    match expr {
        Some(e) if !is_null(e) => Ok(Some(parse_string(e)?)),
        _ => Ok(None),
    }
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    parse_string(expr)?
        .parse()
        .map_err(|e: ParseEnumError| SqlError::Parse(e.to_string()))
}

fn parse_enum_or_null<T>(expr: &Expr) -> Result<Option<T>, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    if is_null(expr) {
        Ok(None)
    } else {
        parse_enum(expr).map(Some)
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid(expr).map(Some)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range (expected 0..={})", u32::MAX)))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_u32(expr).map(Some)
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
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
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
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
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
