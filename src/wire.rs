use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Every user authenticates with the same shared password.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: String,
}

impl SharedPasswordSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn members_schema() -> Vec<FieldInfo> {
    vec![
        text("name"),
        text("role"),
        int("vacation_balance"),
        int("hour_balance"),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("member"),
        text("role"),
        text("kind"),
        text("date"),
        int("hours"),
        text("status"),
        text("comment"),
    ]
}

fn holidays_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("date"), text("label"), text("kind")]
}

fn summary_schema() -> Vec<FieldInfo> {
    vec![
        text("name"),
        text("role"),
        int("vacation_balance"),
        int("hour_balance"),
        int("vacation_pending"),
        int("vacation_approved"),
        int("vacation_rejected"),
        int("hours_pending"),
        int("hours_approved"),
        int("hours_rejected"),
        int("overlapping"),
    ]
}

fn overlaps_schema() -> Vec<FieldInfo> {
    vec![
        text("request_id"),
        text("member"),
        text("date"),
        text("role"),
        text("status"),
        text("coincides_with"),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text("title"),
        text("start"),
        text("end"),
        text("color"),
        text("text_color"),
        text("source"),
        text("source_id"),
    ]
}

fn feed_schema() -> Vec<FieldInfo> {
    vec![text("feed")]
}

/// Returned by `INSERT INTO requests`, so clients learn generated ids.
fn created_schema() -> Vec<FieldInfo> {
    vec![text("id")]
}

/// Returned by `INSERT INTO approvals`: the status the request ended in.
fn decision_schema() -> Vec<FieldInfo> {
    vec![text("request_id"), text("status")]
}

/// Result columns for a statement, looked up from its target table. Works on
/// unbound statements, where `$n` placeholders keep the SQL from parsing.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();
    let after = |keyword: &str| {
        tokens
            .iter()
            .position(|t| *t == keyword)
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };

    match tokens.first().copied() {
        Some("select") => match after("from") {
            Some("members") => members_schema(),
            Some("requests") => requests_schema(),
            Some("holidays") => holidays_schema(),
            Some("summary") => summary_schema(),
            Some("overlaps") => overlaps_schema(),
            Some("calendar") => calendar_schema(),
            Some("calendar_feed") => feed_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("requests") | Some("holidays") => created_schema(),
            Some("approvals") => decision_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

fn encode_rows<T>(
    schema: &Arc<Vec<FieldInfo>>,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Vec<PgWireResult<DataRow>> {
    items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect()
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows = encode_rows(&schema, items, encode);
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Handler ──────────────────────────────────────────────────────

/// What a write produced, before it is turned into a wire response.
enum WriteOutcome {
    Done(&'static str, usize),
    Created(Ulid),
    Decided(Ulid, RequestStatus),
}

pub struct LeavebookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LeavebookQueryParser>,
}

impl LeavebookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LeavebookQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_write(&self, cmd: Command) -> Result<WriteOutcome, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertMember {
                name,
                role,
                vacation_balance,
                hour_balance,
            } => {
                engine
                    .add_or_update_member(&name, role, vacation_balance, hour_balance)
                    .await?;
                Ok(WriteOutcome::Done("INSERT", 1))
            }
            Command::DeleteMember { name } => {
                let removed = engine.remove_member(&name).await?;
                Ok(WriteOutcome::Done("DELETE", usize::from(removed)))
            }
            Command::InsertRequest {
                id,
                member,
                kind,
                date,
                hours,
                comment,
            } => {
                let id = match id {
                    Some(id) => {
                        engine
                            .create_request_with_id(id, &member, kind, date, hours, comment)
                            .await?;
                        id
                    }
                    None => engine.create_request(&member, kind, date, hours, comment).await?,
                };
                Ok(WriteOutcome::Created(id))
            }
            Command::ApproveRequest { id, comment } => {
                let status = engine.approve(id, comment).await?;
                Ok(WriteOutcome::Decided(id, status))
            }
            Command::RejectRequest { id, comment } => {
                engine.reject(id, comment).await?;
                Ok(WriteOutcome::Done("INSERT", 1))
            }
            Command::DeleteRequest { id } => {
                engine.delete_request(id).await?;
                Ok(WriteOutcome::Done("DELETE", 1))
            }
            Command::InsertHoliday { id, date, label, kind } => {
                let id = match id {
                    Some(id) => {
                        engine.add_holiday_with_id(id, date, &label, kind).await?;
                        id
                    }
                    None => engine.add_holiday(date, &label, kind).await?,
                };
                Ok(WriteOutcome::Created(id))
            }
            Command::DeleteHoliday { id } => {
                engine.remove_holiday(id).await?;
                Ok(WriteOutcome::Done("DELETE", 1))
            }
            other => Err(EngineError::InvalidRequest(match other {
                Command::Batch(_) => "nested batch",
                _ => "not a write",
            })),
        }
    }

    fn outcome_response(outcomes: Vec<WriteOutcome>) -> Response {
        match outcomes.first() {
            Some(WriteOutcome::Created(_)) => rows_response(created_schema(), outcomes, |enc, o| {
                if let WriteOutcome::Created(id) = o {
                    enc.encode_field(&id.to_string())?;
                }
                Ok(())
            }),
            Some(WriteOutcome::Decided(..)) => {
                rows_response(decision_schema(), outcomes, |enc, o| {
                    if let WriteOutcome::Decided(id, status) = o {
                        enc.encode_field(&id.to_string())?;
                        enc.encode_field(&status.as_str())?;
                    }
                    Ok(())
                })
            }
            Some(WriteOutcome::Done(tag, _)) => {
                let tag = *tag;
                let rows = outcomes
                    .iter()
                    .map(|o| match o {
                        WriteOutcome::Done(_, n) => *n,
                        _ => 1,
                    })
                    .sum();
                Response::Execution(Tag::new(tag).with_rows(rows))
            }
            None => Response::Execution(Tag::new("INSERT").with_rows(0)),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::Batch(cmds) => {
                let mut outcomes = Vec::with_capacity(cmds.len());
                for (i, cmd) in cmds.into_iter().enumerate() {
                    let outcome = self.execute_write(cmd).await.map_err(|e| {
                        debug!("batch stopped at row {i}: {e}");
                        engine_err(e)
                    })?;
                    outcomes.push(outcome);
                }
                Ok(Self::outcome_response(outcomes))
            }
            Command::SelectMembers { name } => {
                let members = match name {
                    Some(name) => match engine.get_member(&name).await {
                        Ok(m) => vec![m],
                        Err(EngineError::MemberNotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_members().await,
                };
                Ok(rows_response(members_schema(), members, |enc, m| {
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&m.role.as_str())?;
                    enc.encode_field(&i64::from(m.vacation_balance))?;
                    enc.encode_field(&i64::from(m.hour_balance))
                }))
            }
            Command::SelectRequests { filter } => {
                let requests = engine.list_requests(&filter).await;
                Ok(rows_response(requests_schema(), requests, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.member)?;
                    enc.encode_field(&r.role.as_str())?;
                    enc.encode_field(&r.kind.as_str())?;
                    enc.encode_field(&r.date.to_string())?;
                    enc.encode_field(&i64::from(r.hours))?;
                    enc.encode_field(&r.status.as_str())?;
                    enc.encode_field(&r.comment)
                }))
            }
            Command::SelectHolidays => {
                let holidays = engine.list_holidays().await;
                Ok(rows_response(holidays_schema(), holidays, |enc, h| {
                    enc.encode_field(&h.id.to_string())?;
                    enc.encode_field(&h.date.to_string())?;
                    enc.encode_field(&h.label)?;
                    enc.encode_field(&h.kind.as_str())
                }))
            }
            Command::SelectSummary => {
                let rows = engine.member_summaries().await;
                Ok(rows_response(summary_schema(), rows, |enc, s| {
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.role.map(|r| r.as_str()))?;
                    enc.encode_field(&s.vacation_balance.map(i64::from))?;
                    enc.encode_field(&s.hour_balance.map(i64::from))?;
                    for n in [
                        s.vacation_pending,
                        s.vacation_approved,
                        s.vacation_rejected,
                        s.hours_pending,
                        s.hours_approved,
                        s.hours_rejected,
                        s.overlapping,
                    ] {
                        enc.encode_field(&i64::from(n))?;
                    }
                    Ok(())
                }))
            }
            Command::SelectOverlaps => {
                let report = engine.overlap_report().await;
                Ok(rows_response(overlaps_schema(), report, |enc, c| {
                    enc.encode_field(&c.request_id.to_string())?;
                    enc.encode_field(&c.member)?;
                    enc.encode_field(&c.date.to_string())?;
                    enc.encode_field(&c.role.as_str())?;
                    enc.encode_field(&c.status.as_str())?;
                    enc.encode_field(&c.coincides_with.join(","))
                }))
            }
            Command::SelectCalendar { year } => {
                let events = engine
                    .calendar(year.unwrap_or_else(current_year))
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(calendar_schema(), events, |enc, e| {
                    let (source, source_id) = match e.source {
                        CalendarSource::Request(id) => ("request", Some(id.to_string())),
                        CalendarSource::Holiday(id) => ("holiday", Some(id.to_string())),
                        CalendarSource::Weekend => ("weekend", None),
                    };
                    enc.encode_field(&e.title)?;
                    enc.encode_field(&e.start.to_string())?;
                    enc.encode_field(&e.end.to_string())?;
                    enc.encode_field(&e.color.as_str())?;
                    enc.encode_field(&e.text_color)?;
                    enc.encode_field(&source)?;
                    enc.encode_field(&source_id)
                }))
            }
            Command::SelectCalendarFeed { year } => {
                let feed = engine
                    .calendar_feed_json(year.unwrap_or_else(current_year))
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(feed_schema(), [feed], |enc, f| {
                    enc.encode_field(&f)
                }))
            }
            write => {
                let outcome = self.execute_write(write).await.map_err(engine_err)?;
                Ok(Self::outcome_response(vec![outcome]))
            }
        }
    }
}

fn current_year() -> i32 {
    use chrono::Datelike;
    chrono::Local::now().year()
}

#[async_trait]
impl SimpleQueryHandler for LeavebookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LeavebookQueryParser;

#[async_trait]
impl QueryParser for LeavebookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LeavebookHandler {
    type Statement = String;
    type QueryParser = LeavebookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// `$n` placeholders outside quoted literals and identifiers, as
/// `(byte range, n)` in source order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // a doubled quote is an escaped quote and keeps the literal open
            if b == q && bytes.get(i + 1) == Some(&q) {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
        } else if b == b'\'' || b == b'"' {
            quote = Some(b);
            i += 1;
        } else if b == b'$' {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start + 1
                && let Ok(n) = sql[start + 1..i].parse::<usize>()
            {
                found.push((start..i, n));
            }
        } else {
            i += 1;
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Each placeholder in the original text is replaced once; substituted values
/// are never rescanned.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;

    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LeavebookFactory {
    handler: Arc<LeavebookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LeavebookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SharedPasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LeavebookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LeavebookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(LeavebookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error. Class P0 is PL/pgSQL's raise_exception
/// family; the specific codes let clients branch without parsing messages.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::MemberNotFound(_)
        | EngineError::RequestNotFound(_)
        | EngineError::HolidayNotFound(_) => "P0002",
        EngineError::InsufficientBalance { .. } => "P0003",
        EngineError::InvalidTransition { .. } => "P0004",
        EngineError::DuplicateMember(_) | EngineError::DuplicateId(_) => "23505",
        EngineError::InvalidRequest(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
