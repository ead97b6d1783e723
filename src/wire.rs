use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse, Response,
    Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::api::ConflictCheckResponse;
use crate::auth::SlotbookAuthSource;
use crate::engine::{BookingEngine, BookingError, OverrideRecord, Reservation};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, LessonChange, RecordFilter, SqlError};

pub struct SlotbookHandler {
    engine: Arc<BookingEngine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<BookingEngine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertStudent { student } => {
                engine.register_student(student).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSlot { request, by } => {
                let slot = engine.create_slot(request, by.as_ref()).await.map_err(booking_err)?;
                slot_rows(&[slot])
            }
            Command::UpdateSlot { id, status } => {
                engine.transition_slot(id, status).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertLesson { request, by } => {
                let lesson = engine.create_lesson(request, by.as_ref()).await.map_err(booking_err)?;
                lesson_rows(&[lesson])
            }
            Command::UpdateLesson { id, change, by } => {
                match change {
                    LessonChange::Status(status) => {
                        engine.update_lesson_status(id, status).await.map_err(booking_err)?;
                    }
                    LessonChange::Reschedule {
                        date,
                        start,
                        duration_min,
                    } => {
                        engine
                            .reschedule_lesson(id, date, start, duration_min, by.as_ref())
                            .await
                            .map_err(booking_err)?;
                    }
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertReservation {
                slot_id,
                student_ids,
                by,
            } => {
                let reservation = engine
                    .book(slot_id, &student_ids, by.as_ref())
                    .await
                    .map_err(booking_err)?;
                reservation_rows(&reservation)
            }
            Command::SelectStudents { id } => {
                let student = engine.get_student(id).await.map_err(booking_err)?;
                let schema = Arc::new(student_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&student.id.to_string())?;
                encoder.encode_field(&student.name)?;
                encoder.encode_field(&student.phone)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { filter } => {
                let slots = match filter {
                    RecordFilter::ById(id) => vec![engine.get_slot(id).await.map_err(booking_err)?],
                    RecordFilter::Range { range, teacher_id } => {
                        engine.list_slots(range, teacher_id).await.map_err(booking_err)?
                    }
                };
                slot_rows(&slots)
            }
            Command::SelectLessons { filter } => {
                let lessons = match filter {
                    RecordFilter::ById(id) => vec![engine.get_lesson(id).await.map_err(booking_err)?],
                    RecordFilter::Range { range, teacher_id } => {
                        engine.list_lessons(range, teacher_id).await.map_err(booking_err)?
                    }
                };
                lesson_rows(&lessons)
            }
            Command::SelectAvailableSlots { range, teacher_id } => {
                let slots = engine.available_slots(range, teacher_id).await.map_err(booking_err)?;
                slot_rows(&slots)
            }
            Command::SelectConflicts { request } => {
                let response = engine.check_request(&request).await.map_err(booking_err)?;
                conflict_rows(&response)
            }
            Command::SelectOverrides { operation } => {
                let records: Vec<OverrideRecord> = engine
                    .overrides()
                    .into_iter()
                    .filter(|r| operation.as_ref().is_none_or(|op| &r.operation == op))
                    .collect();
                override_rows(&records)
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn student_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), text("phone")]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("teacher_id"),
        text("date"),
        text("start"),
        text("end"),
        text("status"),
        text("kind"),
        text("lesson_ids"),
        text("student_ids"),
    ]
}

fn lesson_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("student_ids"),
        text("teacher_id"),
        text("date"),
        text("start"),
        int8("duration_min"),
        text("status"),
        text("kind"),
        int8("price_cents"),
    ]
}

/// One row per requested student.
fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("student_id"),
        text("lesson_id"),
        text("error"),
        text("slot_id"),
        text("slot_update"),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![text("kind"), text("id"), text("label"), text("time_range")]
}

fn override_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("actor"),
        int8("at"),
        text("reason"),
        text("operation"),
        text("overridden"),
    ]
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(",")
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    records: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = records
        .iter()
        .map(|record| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, record)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn slot_rows(slots: &[Slot]) -> PgWireResult<Vec<Response>> {
    query_response(slot_schema(), slots, |encoder, slot| {
        encoder.encode_field(&slot.id.to_string())?;
        encoder.encode_field(&slot.teacher_id.map(|t| t.to_string()))?;
        encoder.encode_field(&slot.date.to_string())?;
        encoder.encode_field(&format_hhmm(slot.start))?;
        encoder.encode_field(&format_hhmm(slot.end))?;
        encoder.encode_field(&slot.status.as_str())?;
        encoder.encode_field(&slot.kind.map(|k| k.as_str()))?;
        encoder.encode_field(&join_ids(&slot.lesson_ids))?;
        encoder.encode_field(&join_ids(&slot.student_ids))?;
        Ok(())
    })
}

fn lesson_rows(lessons: &[Lesson]) -> PgWireResult<Vec<Response>> {
    query_response(lesson_schema(), lessons, |encoder, lesson| {
        encoder.encode_field(&lesson.id.to_string())?;
        encoder.encode_field(&join_ids(&lesson.student_ids))?;
        encoder.encode_field(&lesson.teacher_id.map(|t| t.to_string()))?;
        encoder.encode_field(&lesson.date.to_string())?;
        encoder.encode_field(&format_hhmm(lesson.start))?;
        encoder.encode_field(&(lesson.duration_min as i64))?;
        encoder.encode_field(&lesson.status.as_str())?;
        encoder.encode_field(&lesson.kind.as_str())?;
        encoder.encode_field(&lesson.price_cents.map(|p| p as i64))?;
        Ok(())
    })
}

fn reservation_rows(reservation: &Reservation) -> PgWireResult<Vec<Response>> {
    let mut per_student: Vec<(Ulid, Option<Ulid>, Option<String>)> = reservation
        .lessons
        .iter()
        .flat_map(|l| l.student_ids.iter().map(move |s| (*s, Some(l.id), None)))
        .collect();
    per_student.extend(reservation.failures.iter().map(|(s, e)| (*s, None, Some(e.clone()))));

    let slot_id = reservation.slot.id.to_string();
    let slot_update = match &reservation.slot_update {
        crate::engine::SlotUpdate::Linked => "linked".to_string(),
        crate::engine::SlotUpdate::StatusOnly => "status_only".to_string(),
        crate::engine::SlotUpdate::Failed(e) => format!("failed: {e}"),
    };
    query_response(reservation_schema(), &per_student, |encoder, (student, lesson, error)| {
        encoder.encode_field(&student.to_string())?;
        encoder.encode_field(&lesson.map(|l| l.to_string()))?;
        encoder.encode_field(error)?;
        encoder.encode_field(&slot_id)?;
        encoder.encode_field(&slot_update)?;
        Ok(())
    })
}

fn conflict_rows(response: &ConflictCheckResponse) -> PgWireResult<Vec<Response>> {
    query_response(conflict_schema(), &response.conflicts, |encoder, item| {
        let kind = match item.kind {
            crate::api::ConflictKind::Lesson => "lesson",
            crate::api::ConflictKind::Slot => "slot",
        };
        encoder.encode_field(&kind)?;
        encoder.encode_field(&item.id.to_string())?;
        encoder.encode_field(&item.label)?;
        encoder.encode_field(&item.time_range)?;
        Ok(())
    })
}

fn override_rows(records: &[OverrideRecord]) -> PgWireResult<Vec<Response>> {
    query_response(override_schema(), records, |encoder, record| {
        encoder.encode_field(&record.id.to_string())?;
        encoder.encode_field(&record.actor)?;
        encoder.encode_field(&record.at)?;
        encoder.encode_field(&record.reason)?;
        encoder.encode_field(&record.operation)?;
        encoder.encode_field(&join_ids(&record.overridden))?;
        Ok(())
    })
}

/// Result columns of a statement, derived from its verb and target table.
/// Statements that return no rows describe as empty.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ',' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_matches('"').to_lowercase())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };

    match words.first().map(String::as_str) {
        Some("select") => match after("from") {
            Some("students") => student_schema(),
            Some("slots") | Some("available_slots") => slot_schema(),
            Some("lessons") => lesson_schema(),
            Some("conflicts") => conflict_schema(),
            Some("overrides") => override_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("slots") => slot_schema(),
            Some("lessons") => lesson_schema(),
            Some("reservations") => reservation_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<BookingEngine>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: SlotbookFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each booking failure class.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Validation(_) => "22023",
        BookingError::Conflict(_) => "23P01",
        BookingError::StoreUnavailable(_) => "08006",
        BookingError::DegradedWrite(_) => "P0001",
        BookingError::NotFound(_) => "P0002",
        BookingError::InvalidTransition(_) => "55000",
        BookingError::LimitExceeded(_) => "54000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConflictSet, DegradedReport};

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM slots WHERE date = $1 AND teacher_id = $2"), 2);
        assert_eq!(count_params("SELECT * FROM lessons WHERE id = $12"), 12);
        assert_eq!(count_params("SELECT * FROM overrides"), 0);
    }

    #[test]
    fn result_schema_follows_target_table() {
        assert_eq!(names(&result_schema("SELECT * FROM available_slots WHERE date = $1"))[0], "id");
        assert_eq!(result_schema("select * from lessons where id = $1").len(), 9);
        assert_eq!(
            names(&result_schema("INSERT INTO reservations (slot_id, student_ids) VALUES ($1, $2)"))[0],
            "student_id"
        );
        assert!(result_schema("INSERT INTO students (id, name) VALUES ($1, $2)").is_empty());
        assert!(result_schema("UPDATE lessons SET status = 'cancelled' WHERE id = $1").is_empty());
        assert_eq!(names(&result_schema(r#"SELECT * FROM "conflicts" WHERE date = $1"#))[3], "time_range");
    }

    #[test]
    fn conflicts_map_to_exclusion_violation() {
        assert_eq!(sqlstate(&BookingError::Conflict(ConflictSet::default())), "23P01");
        assert_eq!(sqlstate(&BookingError::validation("x")), "22023");
        assert_eq!(sqlstate(&BookingError::DegradedWrite(DegradedReport::default())), "P0001");
        assert_eq!(sqlstate(&BookingError::NotFound(Ulid::new())), "P0002");
    }

    #[test]
    fn join_ids_is_comma_separated() {
        let (a, b) = (Ulid::new(), Ulid::new());
        assert_eq!(join_ids(&[a, b]), format!("{a},{b}"));
        assert_eq!(join_ids(&[]), "");
    }
}
