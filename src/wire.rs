use std::fmt::Debug;
use std::io;
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

use crate::auth::{self, ChairbookAuthSource};
use crate::engine::{Engine, EngineError, Scope};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct ChairbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ChairbookQueryParser>,
}

impl ChairbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    /// Scope from the startup user name.
    fn scope<C: ClientInfo>(&self, client: &C) -> Scope {
        let user = client.metadata().get("user").map(String::as_str);
        auth::scope_for(user, self.engine.catalog())
    }

    async fn run(&self, scope: &Scope, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        tracing::debug!(command = label, ?scope, "query");

        let start = Instant::now();
        let result = self.execute_command(scope, cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());

        result.map_err(engine_err)?
    }

    /// Outer error is the engine's; inner is row encoding.
    async fn execute_command(&self, scope: &Scope, cmd: Command) -> Result<PgWireResult<Response>, EngineError> {
        let engine = &self.engine;
        Ok(match cmd {
            Command::SelectLocations => rows(location_schema(), engine.list_locations(), |enc, loc| {
                enc.encode_field(&loc.id)?;
                enc.encode_field(&loc.name)?;
                enc.encode_field(&loc.staff.join(","))
            }),
            Command::SelectStaff { location_id } => {
                let staff = engine.list_staff(&location_id)?;
                rows(staff_schema(), staff, |enc, staff_id| {
                    enc.encode_field(&location_id)?;
                    enc.encode_field(&staff_id)
                })
            }
            Command::SelectServices { location_id, lang } => {
                let categories = engine.list_services(&location_id, lang.as_deref())?;
                let listings = categories
                    .into_iter()
                    .flat_map(|c| c.services.into_iter().map(move |s| (c.category.clone(), s)));
                rows(service_schema(), listings, |enc, (category, service)| {
                    enc.encode_field(&category)?;
                    enc.encode_field(&service.id)?;
                    enc.encode_field(&service.name)?;
                    enc.encode_field(&(service.duration as i32))?;
                    enc.encode_field(&(service.price as i32))
                })
            }
            Command::SelectFreeSlots {
                location_id,
                staff,
                date,
                service_ids,
            } => {
                let slots = engine.free_slots(&location_id, &staff, date, &service_ids).await?;
                rows(free_slot_schema(), slots, |enc, time| enc.encode_field(&time.to_string()))
            }
            Command::SelectFreeStaff {
                location_id,
                date,
                time,
                service_ids,
            } => {
                let staff = engine.free_staff(&location_id, date, time, &service_ids).await?;
                rows(staff_schema(), staff, |enc, staff_id| {
                    enc.encode_field(&location_id)?;
                    enc.encode_field(&staff_id)
                })
            }
            Command::SelectAppointment { id } => {
                let appointment = engine.get_appointment(scope, id).await?;
                self.appointment_rows([appointment])
            }
            Command::SelectAppointments { filter } => {
                let found = engine.list_appointments(scope, filter).await?;
                self.appointment_rows(found)
            }
            Command::InsertAppointment { request, returning } => {
                let appointment = engine.book(request).await?;
                if returning {
                    self.appointment_rows([appointment])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateAppointment { id, patch } => {
                engine.update_appointment(scope, id, patch).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SetStatus { id, status } => {
                engine.set_status(scope, id, status).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(scope, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        })
    }

    fn appointment_rows(&self, found: impl IntoIterator<Item = Appointment>) -> PgWireResult<Response> {
        rows(appointment_schema(), found, |enc, a| {
            let duration = self.engine.appointment_duration(&a);
            encode_appointment(enc, a, duration)
        })
    }
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_appointment(enc: &mut DataRowEncoder, a: Appointment, duration: Minutes) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.location_id)?;
    enc.encode_field(&a.staff_id)?;
    enc.encode_field(&a.date.to_string())?;
    enc.encode_field(&a.time.to_string())?;
    enc.encode_field(&(duration as i32))?;
    enc.encode_field(&a.service_ids.join(","))?;
    enc.encode_field(&a.status.as_str().to_string())?;
    enc.encode_field(&a.customer.name)?;
    enc.encode_field(&a.customer.email)?;
    enc.encode_field(&a.customer.phone)?;
    enc.encode_field(&a.created_at)
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn location_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("staff", Type::VARCHAR),
    ]
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![field("location_id", Type::VARCHAR), field("staff_id", Type::VARCHAR)]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        field("category", Type::VARCHAR),
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration", Type::INT4),
        field("price", Type::INT4),
    ]
}

fn free_slot_schema() -> Vec<FieldInfo> {
    vec![field("time", Type::VARCHAR)]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("staff_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("time", Type::VARCHAR),
        field("duration", Type::INT4),
        field("service_ids", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Result columns for a statement, decided from its text before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("insert") {
        return if lower.contains("returning") {
            appointment_schema()
        } else {
            vec![]
        };
    }
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "locations" => location_schema(),
        "staff" | "free_staff" => staff_schema(),
        "services" => service_schema(),
        "free_slots" => free_slot_schema(),
        "appointments" => appointment_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let scope = self.scope(client);
        Ok(vec![self.run(&scope, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let scope = self.scope(client);
        let sql = substitute_params(portal);
        self.run(&scope, &sql).await
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

/// Substitute $1, $2, ... placeholders with bound parameter values as quoted text.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass over the statement text; bound values are
/// emitted once and never rescanned. Placeholders without a parameter are
/// left as written.
fn bind_text_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => {
                result.push('$');
                result.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ChairbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ChairbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChairbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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
) -> io::Result<()> {
    let factory = Arc::new(ChairbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Store(_) | EngineError::Config(_) => "XX000",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Value(_) | SqlError::BadId(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM staff WHERE location_id = $1"), 1);
        assert_eq!(count_params("UPDATE appointments SET time = $2 WHERE id = $10"), 10);
        assert_eq!(count_params("SELECT * FROM locations"), 0);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn binds_text_params_in_order() {
        let params: Vec<Option<Vec<u8>>> = (1..=10)
            .map(|i| Some(format!("v{i}").into_bytes()))
            .chain([Some(b"O'Brien".to_vec()), None])
            .collect();
        let sql = bind_text_params("$1 $10 $11 $12", &params);
        assert_eq!(sql, "'v1' 'v10' 'O''Brien' NULL");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let params = [Some(id.as_bytes().to_vec()), Some(b"Deal $1 'x'".to_vec())];
        let sql = bind_text_params("UPDATE appointments SET name = $2 WHERE id = $1", &params);
        assert_eq!(
            sql,
            format!("UPDATE appointments SET name = 'Deal $1 ''x''' WHERE id = '{id}'")
        );
        match crate::sql::parse_sql(&sql) {
            Ok(crate::sql::Command::UpdateAppointment { patch, .. }) => {
                assert_eq!(patch.name.as_deref(), Some("Deal $1 'x'"));
            }
            other => panic!("expected UpdateAppointment, got {other:?}"),
        }
    }

    #[test]
    fn unbound_placeholder_kept_verbatim() {
        let params = [Some(b"a".to_vec())];
        assert_eq!(bind_text_params("$1 $2 $ x", &params), "'a' $2 $ x");
    }

    #[test]
    fn result_schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM free_slots WHERE date = $1").len(), 1);
        assert_eq!(result_schema("select * from appointments").len(), 12);
        assert_eq!(result_schema("INSERT INTO appointments (name) VALUES ($1)").len(), 0);
        assert_eq!(result_schema("INSERT INTO appointments (name) VALUES ($1) RETURNING *").len(), 12);
        assert!(result_schema("DELETE FROM appointments WHERE id = $1").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let conflict = EngineError::Conflict {
            staff: "S1".into(),
            date: "2025-01-10".parse().unwrap(),
            time: "10:00".parse().unwrap(),
        };
        for (err, code) in [
            (EngineError::Validation("bad".into()), "22023"),
            (conflict, "23P01"),
            (EngineError::NotFound(ulid::Ulid::new()), "P0002"),
            (EngineError::Forbidden(ulid::Ulid::new()), "42501"),
            (EngineError::Store("disk".into()), "XX000"),
        ] {
            assert_eq!(engine_sqlstate(&err), code, "{err}");
        }
    }
}
