use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::api::{ConflictCheckRequest, Entity};
use crate::engine::{LessonRequest, Override, SlotRequest};
use crate::model::*;

/// Which records a SELECT asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    ById(Ulid),
    Range { range: DateRange, teacher_id: Option<Ulid> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LessonChange {
    Status(LessonStatus),
    Reschedule {
        date: NaiveDate,
        start: NaiveTime,
        duration_min: u32,
    },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStudent {
        student: Student,
    },
    InsertSlot {
        request: SlotRequest,
        by: Option<Override>,
    },
    UpdateSlot {
        id: Ulid,
        status: SlotStatus,
    },
    InsertLesson {
        request: LessonRequest,
        by: Option<Override>,
    },
    UpdateLesson {
        id: Ulid,
        change: LessonChange,
        by: Option<Override>,
    },
    InsertReservation {
        slot_id: Ulid,
        student_ids: Vec<Ulid>,
        by: Option<Override>,
    },
    SelectStudents {
        id: Ulid,
    },
    SelectSlots {
        filter: RecordFilter,
    },
    SelectLessons {
        filter: RecordFilter,
    },
    SelectAvailableSlots {
        range: DateRange,
        teacher_id: Option<Ulid>,
    },
    SelectConflicts {
        request: ConflictCheckRequest,
    },
    SelectOverrides {
        operation: Option<String>,
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column name → value of a single-row INSERT or an UPDATE's SET list.
type Row<'a> = HashMap<String, &'a Expr>;

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table_label(&table), insert.columns.len(), values.len()));
    }
    let row: Row = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(values.iter())
        .collect();

    match table.as_str() {
        "students" => Ok(Command::InsertStudent {
            student: Student {
                id: parse_ulid(required(&row, "id")?)?,
                name: parse_text(required(&row, "name")?)?,
                phone: optional(&row, "phone").map(parse_text_or_null).transpose()?.flatten(),
            },
        }),
        "slots" => Ok(Command::InsertSlot {
            request: SlotRequest {
                id: optional(&row, "id").map(parse_ulid_or_null).transpose()?.flatten(),
                teacher_id: optional(&row, "teacher_id").map(parse_ulid_or_null).transpose()?.flatten(),
                date: parse_date_expr(required(&row, "date")?)?,
                start: parse_time_expr(required(&row, "start")?)?,
                end: parse_time_expr(required(&row, "end")?)?,
                kind: optional(&row, "kind").map(parse_kind_or_null).transpose()?.flatten(),
            },
            by: parse_override(&row)?,
        }),
        "lessons" => Ok(Command::InsertLesson {
            request: LessonRequest {
                student_ids: parse_ulid_list(required(&row, "student_ids")?)?,
                teacher_id: optional(&row, "teacher_id").map(parse_ulid_or_null).transpose()?.flatten(),
                date: parse_date_expr(required(&row, "date")?)?,
                start: parse_time_expr(required(&row, "start")?)?,
                duration_min: parse_u32(required(&row, "duration_min")?)?,
                kind: optional(&row, "kind").map(parse_kind_or_null).transpose()?.flatten(),
                price_cents: optional(&row, "price_cents").map(parse_u64_or_null).transpose()?.flatten(),
            },
            by: parse_override(&row)?,
        }),
        "reservations" => Ok(Command::InsertReservation {
            slot_id: parse_ulid(required(&row, "slot_id")?)?,
            student_ids: parse_ulid_list(required(&row, "student_ids")?)?,
            by: parse_override(&row)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(table: &ast::TableWithJoins, assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut row: Row = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        row.insert(column, &assignment.value);
    }

    match table.as_str() {
        "slots" => {
            if let Some(col) = row.keys().find(|c| c.as_str() != "status") {
                return Err(SqlError::Unsupported(format!("SET {col} on slots")));
            }
            let status = parse_text(required(&row, "status")?)?;
            Ok(Command::UpdateSlot {
                id,
                status: SlotStatus::parse(&status).ok_or_else(|| SqlError::Parse(format!("bad slot status: {status}")))?,
            })
        }
        "lessons" => {
            let by = parse_override(&row)?;
            let change = if let Some(status) = optional(&row, "status") {
                let status = parse_text(status)?;
                LessonChange::Status(
                    LessonStatus::parse(&status).ok_or_else(|| SqlError::Parse(format!("bad lesson status: {status}")))?,
                )
            } else {
                LessonChange::Reschedule {
                    date: parse_date_expr(required(&row, "date")?)?,
                    start: parse_time_expr(required(&row, "start")?)?,
                    duration_min: parse_u32(required(&row, "duration_min")?)?,
                }
            };
            Ok(Command::UpdateLesson { id, change, by })
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

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        collect_conditions(selection, &mut conditions)?;
    }

    match table.as_str() {
        "students" => match conditions.as_slice() {
            [(col, BinaryOperator::Eq, value)] if col == "id" => Ok(Command::SelectStudents { id: parse_ulid(value)? }),
            _ => Err(SqlError::MissingFilter("id")),
        },
        "slots" => Ok(Command::SelectSlots {
            filter: record_filter(&conditions)?,
        }),
        "lessons" => Ok(Command::SelectLessons {
            filter: record_filter(&conditions)?,
        }),
        "available_slots" => match record_filter(&conditions)? {
            RecordFilter::Range { range, teacher_id } => Ok(Command::SelectAvailableSlots { range, teacher_id }),
            RecordFilter::ById(_) => Err(SqlError::MissingFilter("date")),
        },
        "conflicts" => Ok(Command::SelectConflicts {
            request: conflict_request(&conditions)?,
        }),
        "overrides" => {
            let mut operation = None;
            for (col, op, value) in &conditions {
                match (col.as_str(), op) {
                    ("operation", BinaryOperator::Eq) => operation = Some(parse_text(value)?),
                    _ => return Err(SqlError::Unsupported(format!("filter on {col}"))),
                }
            }
            Ok(Command::SelectOverrides { operation })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column op value` comparisons joined by AND. `BETWEEN` becomes two bounds.
type Condition<'a> = (String, BinaryOperator, &'a Expr);

fn collect_conditions<'a>(expr: &'a Expr, out: &mut Vec<Condition<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conditions(left, out)?;
            collect_conditions(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("condition {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
        }
        Expr::Between {
            expr: column,
            negated: false,
            low,
            high,
        } => {
            let col = expr_column_name(column).ok_or_else(|| SqlError::Unsupported(format!("condition {expr}")))?;
            out.push((col.clone(), BinaryOperator::GtEq, low.as_ref()));
            out.push((col, BinaryOperator::LtEq, high.as_ref()));
        }
        Expr::Nested(inner) => collect_conditions(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("condition {other}"))),
    }
    Ok(())
}

fn record_filter(conditions: &[Condition<'_>]) -> Result<RecordFilter, SqlError> {
    let (mut id, mut teacher_id, mut from, mut to) = (None, None, None, None);
    for (col, op, value) in conditions {
        match (col.as_str(), op) {
            ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
            ("teacher_id", BinaryOperator::Eq) => teacher_id = Some(parse_ulid(value)?),
            ("date", BinaryOperator::Eq) => {
                let date = parse_date_expr(value)?;
                from = Some(date);
                to = Some(date);
            }
            ("date", BinaryOperator::GtEq) => from = Some(parse_date_expr(value)?),
            ("date", BinaryOperator::LtEq) => to = Some(parse_date_expr(value)?),
            _ => return Err(SqlError::Unsupported(format!("filter {col} {op}"))),
        }
    }

    if let Some(id) = id {
        return Ok(RecordFilter::ById(id));
    }
    match (from, to) {
        (Some(from), Some(to)) if from <= to => Ok(RecordFilter::Range {
            range: DateRange::new(from, to),
            teacher_id,
        }),
        (Some(_), Some(_)) => Err(SqlError::Parse("date range ends before it starts".into())),
        _ => Err(SqlError::MissingFilter("date")),
    }
}

fn conflict_request(conditions: &[Condition<'_>]) -> Result<ConflictCheckRequest, SqlError> {
    let mut request = ConflictCheckRequest {
        entity: Entity::Lesson,
        record_id: None,
        teacher_id: None,
        date: String::new(),
        start: None,
        end: None,
    };
    for (col, op, value) in conditions {
        if *op != BinaryOperator::Eq {
            return Err(SqlError::Unsupported(format!("filter {col} {op}")));
        }
        match col.as_str() {
            "entity" => {
                request.entity = match parse_text(value)?.to_lowercase().as_str() {
                    "lesson" => Entity::Lesson,
                    "slot" => Entity::Slot,
                    other => return Err(SqlError::Parse(format!("bad entity: {other}"))),
                }
            }
            "record_id" => request.record_id = parse_ulid_or_null(value)?,
            "teacher_id" => request.teacher_id = parse_ulid_or_null(value)?,
            "date" => request.date = parse_text(value)?,
            "start" => request.start = parse_text_or_null(value)?,
            "end" => request.end = parse_text_or_null(value)?,
            _ => return Err(SqlError::Unsupported(format!("filter on {col}"))),
        }
    }
    if request.date.is_empty() {
        return Err(SqlError::MissingFilter("date"));
    }
    Ok(request)
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "students" => "students",
        "slots" => "slots",
        "lessons" => "lessons",
        "reservations" => "reservations",
        _ => "table",
    }
}

fn required<'a>(row: &Row<'a>, column: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(column).copied().ok_or(SqlError::MissingColumn(column))
}

fn optional<'a>(row: &Row<'a>, column: &str) -> Option<&'a Expr> {
    row.get(column).copied()
}

/// `override_by` and `override_reason` travel together; the engine rejects a
/// half-filled pair.
fn parse_override(row: &Row<'_>) -> Result<Option<Override>, SqlError> {
    let actor = optional(row, "override_by").map(parse_text_or_null).transpose()?.flatten();
    let reason = optional(row, "override_reason").map(parse_text_or_null).transpose()?.flatten();
    Ok(match (actor, reason) {
        (None, None) => None,
        (actor, reason) => Some(Override::new(actor.unwrap_or_default(), reason.unwrap_or_default())),
    })
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!("{}-row INSERT", rows.len()))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_text(expr).map(Some) }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid(expr).map(Some) }
}

/// `'id1,id2'` or `ARRAY['id1', 'id2']`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid).collect();
    }
    let text = parse_text(expr)?;
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_kind_or_null(expr: &Expr) -> Result<Option<LessonKind>, SqlError> {
    match parse_text_or_null(expr)? {
        None => Ok(None),
        Some(s) => LessonKind::parse(&s)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad lesson kind: {s}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad integer: {e}")))
            }
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u64::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
