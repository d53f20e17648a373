//! # Query audit logging
//!
//! Every statement a session runs is timed and reported, together with
//! the transaction boundaries it implies. Reporting goes through an
//! [`AuditSink`] handed to each component at construction, so a whole
//! queue client writes to one stream without relying on process-wide
//! logger state. [`TracingSink`] forwards to `tracing` and is what the
//! crate uses unless told otherwise.
//!
//! Transaction tracking mirrors the server's view of a session:
//!
//! ```text
//!            BEGIN / START TRANSACTION
//!            any statement (autocommit off)
//!   Idle  ─────────────────────────────────▶  Active
//!    ▲                                           │
//!    └──────── COMMIT / END / ROLLBACK / ABORT ──┘
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Whether the session currently has an open transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    Active,
}

/// Logged transaction edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionBoundary {
    Begin,
    Commit,
    Rollback,
}

impl TransactionBoundary {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for TransactionBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// What a statement does to the transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Other,
}

impl StatementKind {
    /// Classify by leading keyword, ignoring case and surrounding whitespace
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == ';')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "BEGIN" => Self::Begin,
            "START" if sql.to_ascii_uppercase().contains("TRANSACTION") => Self::Begin,
            "COMMIT" | "END" => Self::Commit,
            "ROLLBACK" | "ABORT" => Self::Rollback,
            _ => Self::Other,
        }
    }
}

/// One executed statement
#[derive(Debug, Clone)]
pub struct StatementRecord<'a> {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub sql: &'a str,
    pub failed: bool,
}

/// Destination for audit output
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// A statement finished, successfully or not
    fn statement(&self, record: &StatementRecord<'_>);

    /// A transaction was opened, committed or rolled back
    fn transaction(&self, boundary: TransactionBoundary, at: DateTime<Utc>);

    /// A best-effort operation failed and the failure was not propagated
    fn swallowed(&self, operation: &str, error: &dyn std::error::Error) {
        warn!(operation = %operation, error = %error, "Best-effort operation failed");
    }
}

/// Forwards audit output to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn statement(&self, record: &StatementRecord<'_>) {
        let duration_ms = record.elapsed.as_secs_f64() * 1000.0;
        debug!(
            target: "trunk::sql",
            started_at = %record.started_at,
            duration_ms = duration_ms,
            failed = record.failed,
            "--{}: {:.3}\n{};",
            record.started_at,
            duration_ms,
            record.sql
        );
    }

    fn transaction(&self, boundary: TransactionBoundary, at: DateTime<Utc>) {
        debug!(target: "trunk::sql", boundary = %boundary, "--{}:\n{};", at, boundary);
    }
}

/// Shared handle to the sink used by a client
pub type SharedSink = Arc<dyn AuditSink>;

/// Default sink for components built without an explicit one
pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Per-session audit state
#[derive(Debug, Clone)]
pub struct QueryAudit {
    sink: SharedSink,
    status: TransactionStatus,
}

impl QueryAudit {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            status: TransactionStatus::Idle,
        }
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Forget transaction state; used when a session is replaced
    pub fn reset(&mut self) {
        self.status = TransactionStatus::Idle;
    }

    /// Report a finished statement and advance the transaction state.
    ///
    /// When the statement moved the session from idle into a transaction
    /// the `BEGIN` marker is reported first, stamped with the statement's
    /// start time.
    pub fn statement_executed(
        &mut self,
        sql: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        failed: bool,
        autocommit: bool,
    ) {
        let kind = StatementKind::classify(sql);
        let before = self.status;
        self.status = match kind {
            StatementKind::Begin => TransactionStatus::Active,
            StatementKind::Commit | StatementKind::Rollback => TransactionStatus::Idle,
            StatementKind::Other if !autocommit => TransactionStatus::Active,
            StatementKind::Other => before,
        };

        if before == TransactionStatus::Idle && self.status == TransactionStatus::Active {
            self.sink.transaction(TransactionBoundary::Begin, started_at);
        }

        self.sink.statement(&StatementRecord {
            started_at,
            elapsed,
            sql,
            failed,
        });

        if before == TransactionStatus::Active && self.status == TransactionStatus::Idle {
            let boundary = if kind == StatementKind::Commit {
                TransactionBoundary::Commit
            } else {
                TransactionBoundary::Rollback
            };
            self.sink.transaction(boundary, Utc::now());
        }
    }

    /// Close the open transaction, if any, reporting `boundary`.
    ///
    /// Returns whether a transaction was actually open.
    pub fn transaction_closed(&mut self, boundary: TransactionBoundary) -> bool {
        if self.status == TransactionStatus::Idle {
            return false;
        }
        self.status = TransactionStatus::Idle;
        self.sink.transaction(boundary, Utc::now());
        true
    }

    /// Report a swallowed best-effort failure
    pub fn swallowed(&self, operation: &str, error: &dyn std::error::Error) {
        self.sink.swallowed(operation, error);
    }
}

/// Sink that keeps every line in memory, for assertions in tests
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.guard().clone()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    fn guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditSink for RecordingSink {
    fn statement(&self, record: &StatementRecord<'_>) {
        let marker = if record.failed { "FAILED " } else { "" };
        self.guard().push(format!("{marker}{}", record.sql));
    }

    fn transaction(&self, boundary: TransactionBoundary, _at: DateTime<Utc>) {
        self.guard().push(format!("<{boundary}>"));
    }

    fn swallowed(&self, operation: &str, error: &dyn std::error::Error) {
        self.guard().push(format!("swallowed {operation}: {error}"));
    }
}
