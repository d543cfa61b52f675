use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, BookingQuery, Command};

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn table_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("table_number", Type::INT8),
        text_field("capacity", Type::INT8),
        text_field("vip", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("table_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("customer_name", Type::VARCHAR),
        text_field("customer_email", Type::VARCHAR),
        text_field("customer_phone", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![text_field("day", Type::VARCHAR), text_field("bookings", Type::INT8)]
}

fn usage_schema() -> Vec<FieldInfo> {
    vec![
        text_field("table_id", Type::VARCHAR),
        text_field("table_number", Type::INT8),
        text_field("bookings", Type::INT8),
    ]
}

fn cancelled_schema() -> Vec<FieldInfo> {
    vec![text_field("cancelled", Type::INT8)]
}

/// Result columns of a statement, guessed from the relation it names. Used
/// for Describe, before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("DELETE") {
        vec![]
    } else if upper.contains("AVAILABLE_TABLES") {
        table_schema()
    } else if upper.contains("BOOKING_STATS") {
        stats_schema()
    } else if upper.contains("TOP_TABLES") {
        usage_schema()
    } else if upper.contains("CANCELLED_COUNT") {
        cancelled_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("TABLES") {
        table_schema()
    } else {
        vec![]
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_table(encoder: &mut DataRowEncoder, t: &Table) -> PgWireResult<()> {
    encoder.encode_field(&t.id.to_string())?;
    encoder.encode_field(&i64::from(t.table_number))?;
    encoder.encode_field(&i64::from(t.capacity))?;
    encoder.encode_field(&t.vip)
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.table_id.to_string())?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&b.customer_name)?;
    encoder.encode_field(&b.customer_email)?;
    encoder.encode_field(&b.customer_phone)?;
    encoder.encode_field(&b.status.to_string())
}

fn tables_response(tables: Vec<Table>) -> Response {
    rows_response(table_schema(), tables, encode_table)
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    rows_response(booking_schema(), bookings, encode_booking)
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23P01",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

// ── Handler ──────────────────────────────────────────────────────

pub struct TableBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TableBookQueryParser>,
}

impl TableBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TableBookQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertTable { spec } => {
                let table = engine.create_table(spec).await.map_err(engine_err)?;
                Ok(tables_response(vec![table]))
            }
            Command::UpdateTable { id, changes } => {
                let table = engine.patch_table(id, &changes).await.map_err(engine_err)?;
                Ok(tables_response(vec![table]))
            }
            Command::DeleteTable { id } => {
                engine.delete_table(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTables { filter } => {
                let tables = engine.list_tables(&filter).await.map_err(engine_err)?;
                Ok(tables_response(tables))
            }
            Command::InsertBooking { request } => {
                let booking = engine.create_booking(request).await.map_err(engine_err)?;
                Ok(bookings_response(vec![booking]))
            }
            Command::UpdateBooking { id, changes } => {
                let booking = if changes.is_status_only() {
                    if changes.status != Some(BookingStatus::Cancelled) {
                        return Err(user_error("22023", "a booking can only be set to CANCELLED".into()));
                    }
                    engine.cancel_booking(id).await
                } else if changes.status.is_some() {
                    return Err(user_error("22023", "status must be changed on its own".into()));
                } else {
                    engine.patch_booking(id, &changes).await
                }
                .map_err(engine_err)?;
                Ok(bookings_response(vec![booking]))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { query } => {
                let bookings = match query {
                    BookingQuery::All => engine.list_bookings().await,
                    BookingQuery::ById(id) => match engine.get_booking(id).await {
                        Ok(b) => Ok(vec![b]),
                        Err(EngineError::BookingNotFound(_)) => Ok(vec![]),
                        Err(e) => Err(e),
                    },
                    BookingQuery::ByTable(id) => engine.bookings_for_table(id).await,
                    BookingQuery::ByEmail(email) => engine.bookings_by_email(&email).await,
                    BookingQuery::InRange { from, to } => engine.bookings_in_range(from, to).await,
                    BookingQuery::Today => engine.today_bookings().await,
                }
                .map_err(engine_err)?;
                Ok(bookings_response(bookings))
            }
            Command::SelectAvailableTables { min_capacity, start, end } => {
                let tables = engine
                    .find_available_tables(min_capacity, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(tables_response(tables))
            }
            Command::SelectBookingStats { from, to } => {
                let days = engine.daily_booking_counts(from, to).await.map_err(engine_err)?;
                Ok(rows_response(stats_schema(), days, |enc, d| {
                    enc.encode_field(&d.day.format("%Y-%m-%d").to_string())?;
                    enc.encode_field(&(d.bookings as i64))
                }))
            }
            Command::SelectTopTables { from, to, limit } => {
                let usage = engine
                    .top_booked_tables(from, to, limit)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(usage_schema(), usage, |enc, u| {
                    enc.encode_field(&u.table_id.to_string())?;
                    enc.encode_field(&u.table_number.map(i64::from))?;
                    enc.encode_field(&(u.bookings as i64))
                }))
            }
            Command::SelectCancelledCount { from, to } => {
                let n = engine
                    .count_cancelled_in_range(from, to)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(cancelled_schema(), vec![n], |enc, n| enc.encode_field(&(*n as i64))))
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for TableBookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct TableBookQueryParser;

#[async_trait]
impl QueryParser for TableBookQueryParser {
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
impl ExtendedQueryHandler for TableBookHandler {
    type Statement = String;
    type QueryParser = TableBookQueryParser;

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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline text-format parameters as quoted literals, highest index first so
/// `$1` does not clobber `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared staff password.
#[derive(Debug)]
pub struct StaffAuthSource {
    password: String,
}

impl StaffAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for StaffAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TableBookFactory {
    handler: Arc<TableBookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<StaffAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TableBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(TableBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StaffAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TableBookFactory {
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
    let factory = Arc::new(TableBookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}
