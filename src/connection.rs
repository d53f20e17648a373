//! # Resilient connection
//!
//! Owns exactly one database session and keeps it usable.
//!
//! A session is a [`PgListener`] on a dedicated single-connection pool, so
//! the same socket both runs statements and receives `NOTIFY` traffic.
//! The owning [`ResilientConnection`] moves through three states:
//!
//! ```text
//!  Disconnected ──connect──▶ Connected ──check fails / read-only──▶ Degraded
//!        ▲                      ▲                                       │
//!        │                      └────────────── reconnect ─────────────┘
//!        └──────────── close ────────────────────────────────────────────
//! ```
//!
//! A degraded session is never repaired in place: the old listener and
//! pool are dropped and a freshly built session is swapped into the slot.
//! Subscriptions do not survive the swap.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{Execute, Executor, Postgres, Row};
use tracing::{debug, info, instrument, warn};

use crate::audit::{
    QueryAudit, SharedSink, StatementKind, TransactionBoundary, TransactionStatus,
};
use crate::error::{Result, TrunkError};
use crate::retry::{retry, RetryPolicy};

/// Liveness and read-only check in one round trip
const RECOVERY_CHECK: &str = "SELECT pg_is_in_recovery()";

/// Tuning for session establishment
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Sessions opened per connect before giving up on a read-only server
    pub readonly_attempts: u32,
    /// Policy for replacing a dead session
    pub reconnect: RetryPolicy,
    /// Run each statement in its own transaction
    pub autocommit: bool,
    /// Upper bound on opening one physical connection
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            readonly_attempts: 3,
            reconnect: RetryPolicy::default(),
            autocommit: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable state of a [`ResilientConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Degraded,
}

struct LiveSession {
    listener: PgListener,
    pool: PgPool,
}

impl LiveSession {
    /// Returns whether the server is in recovery, i.e. cannot take writes
    async fn is_read_only(&mut self, audit: &mut QueryAudit) -> Result<bool> {
        let row = Session::new(&mut self.listener, audit, true)
            .fetch_one(sqlx::query(RECOVERY_CHECK))
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn close(self) {
        drop(self.listener);
        self.pool.close().await;
    }
}

enum Slot {
    Disconnected,
    Connected(LiveSession),
    Degraded,
}

/// Single-owner database session that replaces itself on failure
pub struct ResilientConnection {
    options: PgConnectOptions,
    settings: ConnectionSettings,
    slot: Slot,
    audit: QueryAudit,
}

impl fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("host", &self.options.get_host())
            .field("database", &self.options.get_database())
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ResilientConnection {
    /// Open a writable session right away.
    ///
    /// Fails with [`TrunkError::ConnectionRejected`] when every attempt
    /// lands on a read-only server.
    #[instrument(skip_all, fields(host = %options.get_host()))]
    pub async fn connect(
        options: PgConnectOptions,
        settings: ConnectionSettings,
        sink: SharedSink,
    ) -> Result<Self> {
        let (live, audit) = Self::open(options.clone(), settings.clone(), sink).await?;
        Ok(Self {
            options,
            settings,
            slot: Slot::Connected(live),
            audit,
        })
    }

    /// Build without touching the network; the first use connects
    pub fn new_lazy(options: PgConnectOptions, settings: ConnectionSettings, sink: SharedSink) -> Self {
        Self {
            options,
            settings,
            slot: Slot::Disconnected,
            audit: QueryAudit::new(sink),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connected(_) => ConnectionState::Connected,
            Slot::Degraded => ConnectionState::Degraded,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn autocommit(&self) -> bool {
        self.settings.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.settings.autocommit = autocommit;
    }

    pub fn audit(&self) -> &QueryAudit {
        &self.audit
    }

    /// Report a best-effort failure through this connection's sink
    pub fn report_swallowed(&self, operation: &str, error: &dyn std::error::Error) {
        self.audit.swallowed(operation, error);
    }

    /// Hand out the session after making sure it is alive and writable.
    ///
    /// A connected session is health-checked first, unless it has a transaction
    /// open. If the check hits a connection fault or the server has turned
    /// read-only, the session is dropped and a new one is built under the
    /// reconnect policy; any other check error is returned as is. Whatever
    /// the caller then runs on the returned [`Session`] is not retried.
    pub async fn session(&mut self) -> Result<Session<'_>> {
        self.ensure_healthy().await?;
        let autocommit = self.settings.autocommit;
        match &mut self.slot {
            Slot::Connected(live) => Ok(Session::new(&mut live.listener, &mut self.audit, autocommit)),
            _ => Err(TrunkError::unavailable("session not established")),
        }
    }

    /// The raw listener, connecting first if needed but skipping the health check.
    ///
    /// Used by the blocking wait, which only reads from the socket.
    pub async fn listener(&mut self) -> Result<&mut PgListener> {
        if !self.is_connected() {
            self.reconnect().await?;
        }
        match &mut self.slot {
            Slot::Connected(live) => Ok(&mut live.listener),
            _ => Err(TrunkError::unavailable("session not established")),
        }
    }

    /// Drop the current session; the next use builds a new one
    pub fn mark_degraded(&mut self) {
        if let Slot::Connected(_) = std::mem::replace(&mut self.slot, Slot::Degraded) {
            warn!("Session marked degraded");
        }
        self.audit.reset();
    }

    /// Release the session. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Slot::Connected(live) = std::mem::replace(&mut self.slot, Slot::Disconnected) {
            live.close().await;
            info!("Connection closed");
        }
        self.audit.reset();
    }

    async fn ensure_healthy(&mut self) -> Result<()> {
        if let Slot::Connected(live) = &mut self.slot {
            // never check inside the caller's open (possibly aborted) transaction
            if self.audit.status() == TransactionStatus::Active {
                return Ok(());
            }
            match live.is_read_only(&mut self.audit).await {
                Ok(false) => return Ok(()),
                Ok(true) => warn!("Database became read-only, replacing session"),
                Err(e) if e.is_connection_fault() => {
                    warn!(error = %e, "Health check failed, replacing session")
                }
                Err(e) => return Err(e),
            }
            self.mark_degraded();
        }
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        let options = &self.options;
        let settings = &self.settings;
        let sink = self.audit.sink().clone();

        let (live, audit) = retry(
            &settings.reconnect,
            || Self::open(options.clone(), settings.clone(), sink.clone()),
            |e| warn!(error = %e, "Reconnect attempt failed"),
        )
        .await
        .map_err(TrunkError::unavailable_from)?;

        self.slot = Slot::Connected(live);
        self.audit = audit;
        info!("Session replaced");
        Ok(())
    }

    /// Open sessions until one is writable or the read-only budget is spent
    async fn open(
        options: PgConnectOptions,
        settings: ConnectionSettings,
        sink: SharedSink,
    ) -> Result<(LiveSession, QueryAudit)> {
        let attempts = settings.readonly_attempts.max(1);
        for attempt in 1..=attempts {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(settings.connect_timeout)
                .connect_with(options.clone())
                .await?;
            let listener = PgListener::connect_with(&pool).await?;
            let mut live = LiveSession { listener, pool };
            let mut audit = QueryAudit::new(sink.clone());

            if !live.is_read_only(&mut audit).await? {
                info!(attempt = attempt, "Connected to database");
                return Ok((live, audit));
            }

            warn!(
                attempt = attempt,
                max_attempts = attempts,
                "Database is read-only, reconnecting"
            );
            live.close().await;
        }
        Err(TrunkError::ConnectionRejected { attempts })
    }
}

/// Borrowed view of a live session.
///
/// Every statement goes through the audit log. With autocommit off, the
/// first ordinary statement on an idle session opens a transaction that
/// stays open until [`Session::commit`] or [`Session::rollback`].
pub struct Session<'c> {
    listener: &'c mut PgListener,
    audit: &'c mut QueryAudit,
    autocommit: bool,
}

impl<'c> Session<'c> {
    fn new(listener: &'c mut PgListener, audit: &'c mut QueryAudit, autocommit: bool) -> Self {
        Self {
            listener,
            audit,
            autocommit,
        }
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.audit.status()
    }

    pub async fn execute<'q, E>(&mut self, query: E) -> Result<PgQueryResult>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let sql = query.sql();
        self.begin_if_needed(sql).await?;
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = (&mut *self.listener).execute(query).await;
        self.audit
            .statement_executed(sql, started_at, clock.elapsed(), result.is_err(), self.autocommit);
        Ok(result?)
    }

    pub async fn fetch_one<'q, E>(&mut self, query: E) -> Result<PgRow>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let sql = query.sql();
        self.begin_if_needed(sql).await?;
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = (&mut *self.listener).fetch_one(query).await;
        self.audit
            .statement_executed(sql, started_at, clock.elapsed(), result.is_err(), self.autocommit);
        Ok(result?)
    }

    pub async fn fetch_optional<'q, E>(&mut self, query: E) -> Result<Option<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let sql = query.sql();
        self.begin_if_needed(sql).await?;
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = (&mut *self.listener).fetch_optional(query).await;
        self.audit
            .statement_executed(sql, started_at, clock.elapsed(), result.is_err(), self.autocommit);
        Ok(result?)
    }

    pub async fn fetch_all<'q, E>(&mut self, query: E) -> Result<Vec<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let sql = query.sql();
        self.begin_if_needed(sql).await?;
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = (&mut *self.listener).fetch_all(query).await;
        self.audit
            .statement_executed(sql, started_at, clock.elapsed(), result.is_err(), self.autocommit);
        Ok(result?)
    }

    /// Subscribe this session to `channel`
    pub async fn listen(&mut self, channel: &str) -> Result<()> {
        let sql = format!("LISTEN {}", quote_ident(channel));
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.listener.listen(channel).await;
        self.audit
            .statement_executed(&sql, started_at, clock.elapsed(), result.is_err(), true);
        Ok(result?)
    }

    /// Drop the subscription to `channel`
    pub async fn unlisten(&mut self, channel: &str) -> Result<()> {
        let sql = format!("UNLISTEN {}", quote_ident(channel));
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.listener.unlisten(channel).await;
        self.audit
            .statement_executed(&sql, started_at, clock.elapsed(), result.is_err(), true);
        Ok(result?)
    }

    /// Commit the open transaction; a no-op on an idle session
    pub async fn commit(&mut self) -> Result<()> {
        self.close_transaction(TransactionBoundary::Commit).await
    }

    /// Roll back the open transaction; a no-op on an idle session
    pub async fn rollback(&mut self) -> Result<()> {
        self.close_transaction(TransactionBoundary::Rollback).await
    }

    async fn close_transaction(&mut self, boundary: TransactionBoundary) -> Result<()> {
        if self.audit.status() == TransactionStatus::Idle {
            debug!(boundary = %boundary, "No open transaction");
            return Ok(());
        }
        (&mut *self.listener).execute(boundary.as_sql()).await?;
        self.audit.transaction_closed(boundary);
        Ok(())
    }

    async fn begin_if_needed(&mut self, sql: &str) -> Result<()> {
        if self.autocommit
            || self.audit.status() == TransactionStatus::Active
            || StatementKind::classify(sql) != StatementKind::Other
        {
            return Ok(());
        }
        (&mut *self.listener).execute("BEGIN").await?;
        Ok(())
    }
}

/// Double-quote an identifier the way the server expects
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
