//! # Notification channel client
//!
//! LISTEN/NOTIFY on top of a [`ResilientConnection`]. Notifications are a
//! wake-up hint only: subscribing and sending are best-effort, and
//! nothing here is relied upon for exactly-once delivery.
//!
//! Waiting never polls. [`NotificationClient::wait`] parks on the session
//! socket through tokio's reactor and wakes on readiness or on the
//! caller's deadline, whichever comes first.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgNotification;
use sqlx::Row;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::audit::SharedSink;
use crate::connection::{ConnectionSettings, ResilientConnection};
use crate::error::{Result, TrunkError};

/// A received `NOTIFY`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Backend process id of the sender
    pub process_id: u32,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            process_id: 0,
        }
    }
}

impl From<PgNotification> for Notification {
    fn from(notification: PgNotification) -> Self {
        Self {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
            process_id: notification.process_id(),
        }
    }
}

/// Received notifications not yet claimed by a waiter, in arrival order
#[derive(Debug, Default)]
pub struct PendingNotifications {
    queue: VecDeque<Notification>,
}

impl PendingNotifications {
    pub fn push(&mut self, notification: Notification) {
        self.queue.push_back(notification);
    }

    /// Remove and return the oldest notification on `channel` (any channel
    /// when `None`), leaving the others in place
    pub fn take_matching(&mut self, channel: Option<&str>) -> Option<Notification> {
        let position = match channel {
            Some(channel) => self.queue.iter().position(|n| n.channel == channel)?,
            None => 0,
        };
        self.queue.remove(position)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// LISTEN/NOTIFY client owning one session
#[derive(Debug)]
pub struct NotificationClient {
    conn: ResilientConnection,
    pending: PendingNotifications,
}

impl NotificationClient {
    pub fn new(conn: ResilientConnection) -> Self {
        Self {
            conn,
            pending: PendingNotifications::default(),
        }
    }

    /// Connect a fresh session and wrap it
    pub async fn connect(
        options: sqlx::postgres::PgConnectOptions,
        settings: ConnectionSettings,
        sink: SharedSink,
    ) -> Result<Self> {
        let conn = ResilientConnection::connect(options, settings, sink).await?;
        Ok(Self::new(conn))
    }

    pub fn connection(&self) -> &ResilientConnection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ResilientConnection {
        &mut self.conn
    }

    /// Notifications received but not yet handed to a waiter
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe to `channel`. Failures are reported, not returned.
    #[instrument(skip(self))]
    pub async fn listen(&mut self, channel: &str) {
        let result = match self.conn.session().await {
            Ok(mut session) => session.listen(channel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.conn.report_swallowed("listen", &e);
        }
    }

    /// Unsubscribe from `channel`. Failures are reported, not returned.
    #[instrument(skip(self))]
    pub async fn unlisten(&mut self, channel: &str) {
        let result = match self.conn.session().await {
            Ok(mut session) => session.unlisten(channel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.conn.report_swallowed("unlisten", &e);
        }
    }

    /// Send a notification on `channel`. Failures are reported, not returned.
    #[instrument(skip(self, payload))]
    pub async fn notify(&mut self, channel: &str, payload: Option<&str>) {
        let result = match self.conn.session().await {
            Ok(mut session) => session
                .execute(sqlx::query("SELECT pg_notify($1, $2)").bind(channel).bind(payload))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.conn.report_swallowed("notify", &e);
        }
    }

    /// Channels this session is subscribed to, as the server sees it
    pub async fn channels(&mut self) -> Result<Vec<String>> {
        let mut session = self.conn.session().await?;
        let rows = session
            .fetch_all(sqlx::query("SELECT pg_listening_channels()"))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(TrunkError::from))
            .collect()
    }

    /// Wait for a notification on `channel` (or any channel).
    ///
    /// Buffered notifications are served first, oldest match wins. With no
    /// match buffered the call blocks on the socket until a matching one
    /// arrives or `timeout` runs out: `None` waits forever, `Some(ZERO)`
    /// only looks at what is already readable. Running out of time yields
    /// [`TrunkError::Empty`].
    pub async fn wait(&mut self, channel: Option<&str>, timeout: Option<Duration>) -> Result<Notification> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(notification) = self.pending.take_matching(channel) {
                return Ok(notification);
            }

            let listener = self.conn.listener().await?;
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, listener.try_recv()).await {
                    Ok(received) => received,
                    Err(_elapsed) => return Err(TrunkError::Empty),
                },
                None => listener.try_recv().await,
            };

            match received {
                Ok(Some(notification)) => {
                    let notification = Notification::from(notification);
                    debug!(channel = %notification.channel, "Notification received");
                    self.pending.push(notification);
                }
                Ok(None) => {
                    warn!("Connection lost while waiting for notifications");
                    self.conn.mark_degraded();
                    return Err(TrunkError::unavailable("connection lost while waiting"));
                }
                Err(e) => {
                    self.conn.mark_degraded();
                    return Err(TrunkError::unavailable_from(TrunkError::Database(e)));
                }
            }
        }
    }

    /// Queue-style wait: `block == false` never blocks
    pub async fn get(&mut self, channel: Option<&str>, block: bool, timeout: Option<Duration>) -> Result<Notification> {
        let timeout = if block { timeout } else { Some(Duration::ZERO) };
        self.wait(channel, timeout).await
    }

    /// Endless stream of notifications on `channel` (or any channel).
    ///
    /// Each item is one unbounded [`wait`](Self::wait). The first error is
    /// yielded and ends the stream.
    pub fn stream<'a>(&'a mut self, channel: Option<&'a str>) -> impl Stream<Item = Result<Notification>> + 'a {
        stream::unfold(Some(self), move |client| async move {
            let Some(client) = client else {
                return None;
            };
            match client.wait(channel, None).await {
                Ok(notification) => Some((Ok(notification), Some(client))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    pub async fn close(&mut self) {
        self.conn.close().await;
    }
}
