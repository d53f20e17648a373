//! # Locking queue
//!
//! Durable queue over the `public.trunk_queue` table.
//!
//! The table is the only source of truth. A consumer first waits for a
//! notification on the queue's channel, purely to avoid busy polling,
//! and then always runs the claim routine `public.pop_lock`, which locks
//! the oldest row with `FOR UPDATE SKIP LOCKED`, deletes it and returns
//! it in one statement. Notifications may be dropped, coalesced, or sent
//! before anyone listens; none of that affects which consumer gets which
//! row, only how quickly an idle consumer notices new work.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use sqlx::{FromRow, Row};
use tracing::{debug, info, instrument};

use crate::audit::{default_sink, SharedSink};
use crate::config::TrunkConfig;
use crate::connection::{ConnectionSettings, ResilientConnection};
use crate::error::{Result, TrunkError};
use crate::notify::NotificationClient;

const INSERT_SQL: &str = "INSERT INTO public.trunk_queue (name, message) VALUES ($1, $2)";
const CLAIM_SQL: &str = "SELECT id, message FROM public.pop_lock($1)";
const COUNT_SQL: &str = "SELECT COUNT(*) FROM public.trunk_queue WHERE name = $1";
const PURGE_SQL: &str = "DELETE FROM public.trunk_queue WHERE name = $1";

/// A claimed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Table identity; lower ids are claimed first
    pub id: i64,
    #[sqlx(rename = "message")]
    pub payload: Vec<u8>,
}

/// Queue client owning one session.
///
/// Not meant for concurrent use: share it behind a lock, or give each
/// consumer its own client.
#[derive(Debug)]
pub struct PgQueue {
    trunk: NotificationClient,
}

impl PgQueue {
    pub fn new(trunk: NotificationClient) -> Self {
        Self { trunk }
    }

    /// Connect using the configured URL and connection settings
    pub async fn connect(config: &TrunkConfig) -> Result<Self> {
        Self::connect_with_sink(config, default_sink()).await
    }

    pub async fn connect_with_sink(config: &TrunkConfig, sink: SharedSink) -> Result<Self> {
        let options = config.connect_options()?;
        Self::from_options(options, ConnectionSettings::from(&config.connection), sink).await
    }

    pub async fn from_options(
        options: PgConnectOptions,
        settings: ConnectionSettings,
        sink: SharedSink,
    ) -> Result<Self> {
        let conn = ResilientConnection::connect(options, settings, sink).await?;
        info!("Queue client connected");
        Ok(Self::new(NotificationClient::new(conn)))
    }

    pub fn notifications(&mut self) -> &mut NotificationClient {
        &mut self.trunk
    }

    /// Subscribe to the queue's channel so blocking gets wake promptly
    #[instrument(skip(self))]
    pub async fn create(&mut self, name: &str) {
        self.trunk.listen(name).await;
    }

    /// Store a message, then signal waiting consumers.
    ///
    /// The insert is durable once this returns `Ok`; the signal is
    /// best-effort and its failure is only reported.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn put(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        {
            let mut session = self.trunk.connection_mut().session().await?;
            session
                .execute(sqlx::query(INSERT_SQL).bind(name).bind(payload))
                .await?;
        }
        self.trunk.notify(name, None).await;
        Ok(())
    }

    /// Claim the oldest message of `name`.
    ///
    /// With `block` set, first waits up to `timeout` (forever when `None`)
    /// for a notification on the queue's channel; with `block` unset the
    /// wait is a single non-blocking check. Either way the claim runs
    /// afterwards, and [`TrunkError::Empty`] means it found nothing.
    #[instrument(skip(self))]
    pub async fn get(&mut self, name: &str, block: bool, timeout: Option<Duration>) -> Result<Message> {
        match self.trunk.get(Some(name), block, timeout).await {
            Ok(_) | Err(TrunkError::Empty) => {}
            Err(e) => self.trunk.connection().report_swallowed("wait", &e),
        }

        let mut session = self.trunk.connection_mut().session().await?;
        let row = session
            .fetch_optional(sqlx::query(CLAIM_SQL).bind(name))
            .await?;

        match row {
            Some(row) => {
                let message = Message::from_row(&row)?;
                debug!(id = message.id, "Message claimed");
                Ok(message)
            }
            None => Err(TrunkError::Empty),
        }
    }

    pub async fn get_nowait(&mut self, name: &str) -> Result<Message> {
        self.get(name, false, None).await
    }

    /// Number of unclaimed messages
    pub async fn qsize(&mut self, name: &str) -> Result<u64> {
        let mut session = self.trunk.connection_mut().session().await?;
        let row = session.fetch_one(sqlx::query(COUNT_SQL).bind(name)).await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn empty(&mut self, name: &str) -> Result<bool> {
        Ok(self.qsize(name).await? == 0)
    }

    /// Delete every unclaimed message of `name`, returning how many went
    #[instrument(skip(self))]
    pub async fn purge(&mut self, name: &str) -> Result<u64> {
        let mut session = self.trunk.connection_mut().session().await?;
        let deleted = session
            .execute(sqlx::query(PURGE_SQL).bind(name))
            .await?
            .rows_affected();
        info!(deleted = deleted, "Queue purged");
        Ok(deleted)
    }

    pub async fn close(&mut self) {
        self.trunk.close().await;
    }
}
