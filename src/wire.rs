use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use ulid::Ulid;

use crate::auth::CourtsideAuthSource;
use crate::engine::{Engine, EngineError, with_deadline};
use crate::limits::STATEMENT_TIMEOUT_MS;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

const CHANNEL_PREFIX: &str = "event_";

/// One handler per connection: LISTEN subscriptions live as long as the session.
pub struct CourtsideHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CourtsideQueryParser>,
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<Notice>>>,
}

impl CourtsideHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CourtsideQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute one statement and send pending notices ahead of its result.
    async fn run<C>(&self, client: &mut C, sql: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = session_actor(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(STATEMENT_TIMEOUT_MS);
        let result = with_deadline(deadline, self.execute_command(&engine, &actor, cmd)).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notices(client).await?;
        result.map_err(engine_err)
    }

    /// Flush every notice received since the last statement as NotificationResponse messages.
    async fn deliver_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.subscriptions.lock().await;
            subs.retain(|channel, rx| loop {
                match rx.try_recv() {
                    Ok(notice) => pending.push((channel.clone(), notice.payload())),
                    Err(broadcast::error::TryRecvError::Empty) => break true,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        tracing::warn!("{channel}: dropped {n} notices for a slow listener");
                    }
                    Err(broadcast::error::TryRecvError::Closed) => break false,
                }
            });
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &ActorId,
        cmd: Command,
    ) -> Result<Vec<Response>, EngineError> {
        match cmd {
            Command::InsertEvent {
                id,
                title,
                starts_at,
                location,
                close_at,
            } => {
                engine
                    .create_event(id, &title, starts_at, &location, close_at, actor)
                    .await?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::UpdateEventStatus { id, status } => {
                engine.set_event_status(id, status, actor).await?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::InsertCourt {
                id,
                event_id,
                name,
                capacity,
                is_open,
                sort_order,
            } => {
                engine
                    .add_court(id, event_id, &name, capacity, is_open, sort_order, actor)
                    .await?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::UpdateCourt { id, patch } => {
                engine.update_court(id, patch, actor).await?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteCourt { id } => {
                engine.remove_court(id, actor).await?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::InsertCaptain { event_id, user_id } => {
                let added = engine
                    .assign_captain(event_id, ActorId::new(user_id), actor)
                    .await?;
                Ok(vec![tag("INSERT", usize::from(added))])
            }
            Command::DeleteCaptain { event_id, user_id } => {
                let removed = engine
                    .remove_captain(event_id, &ActorId::new(user_id), actor)
                    .await?;
                Ok(vec![tag("DELETE", usize::from(removed))])
            }
            Command::InsertRegistration {
                id,
                event_id,
                court_id,
            } => {
                engine
                    .register_with_id(id, event_id, actor, court_id)
                    .await?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::InsertGuest {
                id,
                event_id,
                court_id,
                guest_name,
            } => {
                engine
                    .register_guest_with_id(id, event_id, actor, &guest_name, court_id)
                    .await?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::MoveRegistration { id, court_id } => {
                engine.move_registration(id, court_id, actor).await?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteRegistration { id } => {
                engine.cancel(id, actor).await?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectEvents { id } => {
                let events: Vec<EventInfo> = engine
                    .list_events()
                    .await
                    .into_iter()
                    .filter(|e| match id {
                        Some(id) => e.id == id,
                        None => e.status != EventStatus::Finalized,
                    })
                    .collect();

                let schema = Arc::new(events_schema());
                let rows: Vec<PgWireResult<_>> = events
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.title)?;
                        encoder.encode_field(&e.starts_at)?;
                        encoder.encode_field(&e.location)?;
                        encoder.encode_field(&e.close_at)?;
                        encoder.encode_field(&e.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectCourts { event_id } => {
                let snapshot = engine.snapshot(event_id).await?;
                let schema = Arc::new(courts_schema());
                let rows: Vec<PgWireResult<_>> = snapshot
                    .courts
                    .iter()
                    .map(|court| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court.court_id.to_string())?;
                        encoder.encode_field(&event_id.to_string())?;
                        encoder.encode_field(&court.name)?;
                        encoder.encode_field(&i64::from(court.capacity))?;
                        encoder.encode_field(&i64::from(court.occupied))?;
                        encoder.encode_field(&i64::from(court.available))?;
                        encoder.encode_field(&court.is_open)?;
                        encoder.encode_field(&i64::from(court.sort_order))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectPlayers { event_id, court_id } => {
                let courts = match (event_id, court_id) {
                    (_, Some(court_id)) => {
                        let (owner, court) = engine.court_players(court_id).await?;
                        if event_id.is_some_and(|e| e != owner) {
                            Vec::new()
                        } else {
                            vec![court]
                        }
                    }
                    (Some(event_id), None) => engine.snapshot(event_id).await?.courts,
                    (None, None) => Vec::new(),
                };
                let schema = Arc::new(players_schema());
                let rows: Vec<PgWireResult<_>> = courts
                    .iter()
                    .flat_map(|court| court.players.iter().map(move |p| (court, p)))
                    .map(|(court, player)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&player.registration_id.to_string())?;
                        encoder.encode_field(&court.court_id.to_string())?;
                        encoder.encode_field(&court.name)?;
                        encoder.encode_field(&player.kind)?;
                        encoder.encode_field(&player.user_id.as_ref().map(|u| u.to_string()))?;
                        encoder.encode_field(&player.name)?;
                        encoder.encode_field(&player.created_by.to_string())?;
                        encoder.encode_field(&player.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWaitlist { event_id } => {
                let snapshot = engine.snapshot(event_id).await?;
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = snapshot
                    .waitlist
                    .iter()
                    .enumerate()
                    .map(|(i, player)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(i as i64 + 1))?;
                        encoder.encode_field(&player.registration_id.to_string())?;
                        encoder.encode_field(&player.kind)?;
                        encoder.encode_field(&player.user_id.as_ref().map(|u| u.to_string()))?;
                        encoder.encode_field(&player.name)?;
                        encoder.encode_field(&player.created_by.to_string())?;
                        encoder.encode_field(&player.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRegistration { id } => {
                let reg = engine.get_registration(id).await?;
                let schema = Arc::new(registrations_schema());
                let rows: Vec<PgWireResult<_>> = std::iter::once(reg)
                    .map(|reg| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&reg.id.to_string())?;
                        encoder.encode_field(&reg.event_id.to_string())?;
                        encoder.encode_field(&reg.subject.kind())?;
                        encoder.encode_field(&reg.display_name())?;
                        encoder.encode_field(&reg.created_by.to_string())?;
                        encoder.encode_field(&reg.state.as_str())?;
                        encoder.encode_field(&reg.state.court_id().map(|c| c.to_string()))?;
                        encoder.encode_field(&(reg.seq as i64))?;
                        encoder.encode_field(&reg.created_at)?;
                        encoder.encode_field(&reg.cancelled_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let event_id = channel_event(&channel)?;
                if engine.get_event(&event_id).is_none() {
                    return Err(EngineError::NotFound(event_id));
                }
                let mut subs = self.subscriptions.lock().await;
                subs.entry(channel)
                    .or_insert_with(|| engine.subscribe(event_id));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.subscriptions.lock().await.remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

fn session_actor<C: ClientInfo>(client: &C) -> PgWireResult<ActorId> {
    match client.metadata().get("user") {
        Some(user) if !user.is_empty() => Ok(ActorId::new(user.as_str())),
        _ => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "28000".into(),
            "session has no user".into(),
        )))),
    }
}

/// `event_{ulid}` to the event id it names.
fn channel_event(channel: &str) -> Result<Ulid, EngineError> {
    let raw = channel
        .get(..CHANNEL_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(CHANNEL_PREFIX))
        .map(|_| &channel[CHANNEL_PREFIX.len()..])
        .ok_or_else(|| {
            EngineError::Invalid(format!("invalid channel: {channel} (expected event_{{id}})"))
        })?;
    Ulid::from_string(raw).map_err(|e| EngineError::Invalid(format!("bad ULID in channel: {e}")))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("starts_at", Type::INT8),
        field("location", Type::VARCHAR),
        field("close_at", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("occupied", Type::INT8),
        field("available", Type::INT8),
        field("is_open", Type::BOOL),
        field("sort_order", Type::INT8),
    ]
}

fn players_schema() -> Vec<FieldInfo> {
    vec![
        field("registration_id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("court_name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        field("position", Type::INT8),
        field("registration_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn registrations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("seq", Type::INT8),
        field("created_at", Type::INT8),
        field("cancelled_at", Type::INT8),
    ]
}

/// Row shape of a SELECT, judged from its FROM table. Empty for everything else.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    match words.skip_while(|w| *w != "from").nth(1) {
        Some("events") => events_schema(),
        Some("courts") => courts_schema(),
        Some("players") => players_schema(),
        Some("waitlist") => waitlist_schema(),
        Some("registrations") => registrations_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

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
        let sql = substitute_params(portal);
        let responses = self.run(client, &sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CourtsideAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtsideHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
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

/// Serve one client socket until it disconnects. Each connection gets its own handler.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CourtsideFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_retryable() {
        tracing::warn!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
