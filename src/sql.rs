use std::collections::BTreeMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{AppointmentPatch, BookingRequest};
use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectLocations,
    SelectStaff {
        location_id: String,
    },
    SelectServices {
        location_id: String,
        lang: Option<String>,
    },
    SelectFreeSlots {
        location_id: String,
        staff: StaffChoice,
        date: CivilDate,
        service_ids: Vec<String>,
    },
    SelectFreeStaff {
        location_id: String,
        date: CivilDate,
        time: ClockTime,
        service_ids: Vec<String>,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    InsertAppointment {
        request: BookingRequest,
        returning: bool,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentPatch,
    },
    SetStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    DeleteAppointment {
        id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const INSERT_COLUMNS: &[&str] = &["location_id", "staff_id", "date", "time", "service_ids", "name", "email", "phone"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let row = &rows[0];
    if insert.columns.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            insert.columns.len(),
            row.len()
        )));
    }

    let mut fields = BTreeMap::new();
    for (column, value) in insert.columns.iter().zip(row) {
        let column = column.value.to_lowercase();
        if !INSERT_COLUMNS.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        fields.insert(column, literal(value)?);
    }
    let mut take = |col: &'static str| fields.remove(col).ok_or(SqlError::MissingColumn(col));

    let request = BookingRequest {
        location_id: take("location_id")?,
        date: take("date")?.parse()?,
        time: take("time")?.parse()?,
        service_ids: split_services(&take("service_ids")?),
        customer: Customer {
            name: take("name")?,
            email: take("email")?,
            phone: take("phone")?,
        },
        staff: take("staff_id").map(|s| StaffChoice::parse(&s)).unwrap_or(StaffChoice::Any),
    };
    Ok(Command::InsertAppointment {
        request,
        returning: insert.returning.is_some(),
    })
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(table: &TableFactor, assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = AppointmentPatch::default();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        let value = literal(&assignment.value)?;
        match column.as_str() {
            "name" => patch.name = Some(value),
            "email" => patch.email = Some(value),
            "phone" => patch.phone = Some(value),
            "location_id" => patch.location_id = Some(value),
            "staff_id" => patch.staff = Some(StaffChoice::parse(&value)),
            "date" => patch.date = Some(value.parse()?),
            "time" => patch.time = Some(value.parse()?),
            "service_ids" => patch.service_ids = Some(split_services(&value)),
            "status" => patch.status = Some(value.parse()?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    Ok(match patch.status_only() {
        Some(status) => Command::SetStatus { id, status },
        None => Command::UpdateAppointment { id, patch },
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::DeleteAppointment {
        id: extract_where_id(&delete.selection)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = BTreeMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let mut take = |col: &'static str| filters.remove(col);
    let require = |value: Option<String>, col: &'static str| value.ok_or(SqlError::MissingFilter(col));

    let cmd = match table.as_str() {
        "locations" => Command::SelectLocations,
        "staff" => Command::SelectStaff {
            location_id: require(take("location_id"), "location_id")?,
        },
        "services" => Command::SelectServices {
            location_id: require(take("location_id"), "location_id")?,
            lang: take("lang"),
        },
        "free_slots" => Command::SelectFreeSlots {
            location_id: require(take("location_id"), "location_id")?,
            staff: take("staff_id").map(|s| StaffChoice::parse(&s)).unwrap_or(StaffChoice::Any),
            date: require(take("date"), "date")?.parse()?,
            service_ids: split_services(&require(take("service_ids"), "service_ids")?),
        },
        "free_staff" => Command::SelectFreeStaff {
            location_id: require(take("location_id"), "location_id")?,
            date: require(take("date"), "date")?.parse()?,
            time: require(take("time"), "time")?.parse()?,
            service_ids: split_services(&require(take("service_ids"), "service_ids")?),
        },
        "appointments" => match take("id") {
            Some(id) => Command::SelectAppointment { id: parse_ulid(&id)? },
            None => Command::SelectAppointments {
                filter: AppointmentFilter {
                    location_id: take("location_id"),
                    staff_id: take("staff_id"),
                    date: take("date").map(|d| d.parse()).transpose()?,
                    status: take("status").map(|s| s.parse()).transpose()?,
                },
            },
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some(column) = filters.into_keys().next() {
        return Err(SqlError::UnknownColumn(column));
    }
    Ok(cmd)
}

/// `a = 'x' AND b = 'y'` into a column → literal map.
fn collect_eq_filters(expr: &Expr, out: &mut BTreeMap<String, String>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(column, literal(right)?);
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Comma-separated service list, order preserved.
fn split_services(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables.first().ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = BTreeMap::new();
    if let Some(sel) = selection {
        collect_eq_filters(sel, &mut filters)?;
    }
    let id = filters.remove("id").ok_or(SqlError::MissingFilter("id"))?;
    if let Some(column) = filters.into_keys().next() {
        return Err(SqlError::UnknownColumn(column));
    }
    parse_ulid(&id)
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

/// String or number literal as text.
fn literal(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Boolean(b)) => Ok(b.to_string()),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::BadId(format!("{s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query exceeds {} bytes", MAX_SQL_LEN)]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("bad id: {0}")]
    BadId(String),
    #[error(transparent)]
    Value(#[from] FormatError),
}
