//! # Transport adapter
//!
//! Shim for messaging frameworks that treat the queue as a pluggable
//! transport: queues are addressed by name, messages are JSON documents,
//! and `new_queue`/`put`/`purge` retry transient failures a few times
//! before giving up. `get` never blocks and passes [`TrunkError::Empty`]
//! through untouched.
//!
//! Frameworks that want a trait object use [`VirtualChannel`], which fixes
//! the message type to [`serde_json::Value`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::audit::{default_sink, SharedSink};
use crate::config::TrunkConfig;
use crate::connection::ConnectionSettings;
use crate::dsn::ConnectionDescriptor;
use crate::error::{Result, TrunkError};
use crate::queue::PgQueue;
use crate::retry::RetryPolicy;

/// Name-addressed JSON channel over one [`PgQueue`]
#[derive(Debug)]
pub struct QueueChannel {
    queue: PgQueue,
    retry: RetryPolicy,
}

impl QueueChannel {
    pub fn new(queue: PgQueue, retry: RetryPolicy) -> Self {
        Self { queue, retry }
    }

    /// Connect to the database described by `descriptor`, taking session
    /// and retry settings from `config`
    #[instrument(skip_all, fields(host = %descriptor.host))]
    pub async fn open(descriptor: &ConnectionDescriptor, config: &TrunkConfig) -> Result<Self> {
        Self::open_with_sink(descriptor, config, default_sink()).await
    }

    pub async fn open_with_sink(
        descriptor: &ConnectionDescriptor,
        config: &TrunkConfig,
        sink: SharedSink,
    ) -> Result<Self> {
        let options = descriptor.connect_options()?;
        let queue =
            PgQueue::from_options(options, ConnectionSettings::from(&config.connection), sink).await?;
        debug!(descriptor = %descriptor, "Transport channel opened");
        Ok(Self::new(queue, config.transport.retry_policy()))
    }

    pub fn queue(&mut self) -> &mut PgQueue {
        &mut self.queue
    }

    /// Make sure a session is up, then subscribe to the queue's channel
    #[instrument(skip(self))]
    pub async fn new_queue(&mut self, name: &str) -> Result<()> {
        let mut state = self.retry.start();
        loop {
            let ready = self
                .queue
                .notifications()
                .connection_mut()
                .session()
                .await
                .map(|_| ());
            match ready {
                Ok(()) => break,
                Err(e) => state.backoff(e, |e| report_retry("new_queue", name, e)).await?,
            }
        }
        self.queue.create(name).await;
        Ok(())
    }

    /// Serialize `message` as JSON and store it on `name`
    #[instrument(skip(self, message))]
    pub async fn put<T>(&mut self, name: &str, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        let mut state = self.retry.start();
        loop {
            match self.queue.put(name, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) => state.backoff(e, |e| report_retry("put", name, e)).await?,
            }
        }
    }

    /// Claim the oldest message of `name` without waiting and decode it
    pub async fn get<T: DeserializeOwned>(&mut self, name: &str) -> Result<T> {
        let message = self.queue.get_nowait(name).await?;
        Ok(serde_json::from_slice(&message.payload)?)
    }

    pub async fn size(&mut self, name: &str) -> Result<u64> {
        self.queue.qsize(name).await
    }

    /// Drop every pending message of `name`, returning how many went
    #[instrument(skip(self))]
    pub async fn purge(&mut self, name: &str) -> Result<u64> {
        let mut state = self.retry.start();
        loop {
            match self.queue.purge(name).await {
                Ok(deleted) => return Ok(deleted),
                Err(e) => state.backoff(e, |e| report_retry("purge", name, e)).await?,
            }
        }
    }

    pub async fn close(&mut self) {
        self.queue.close().await;
    }
}

fn report_retry(operation: &str, queue: &str, error: &TrunkError) {
    warn!(operation = %operation, queue = %queue, error = %error, "Transport operation failed, retrying");
}

/// Object-safe channel over JSON values
#[async_trait]
pub trait VirtualChannel: Send {
    async fn new_queue(&mut self, name: &str) -> Result<()>;

    async fn put(&mut self, name: &str, message: &Value) -> Result<()>;

    /// Non-blocking; [`TrunkError::Empty`] when nothing is pending
    async fn get(&mut self, name: &str) -> Result<Value>;

    async fn size(&mut self, name: &str) -> Result<u64>;

    async fn purge(&mut self, name: &str) -> Result<u64>;

    async fn close(&mut self);
}

#[async_trait]
impl VirtualChannel for QueueChannel {
    async fn new_queue(&mut self, name: &str) -> Result<()> {
        QueueChannel::new_queue(self, name).await
    }

    async fn put(&mut self, name: &str, message: &Value) -> Result<()> {
        QueueChannel::put(self, name, message).await
    }

    async fn get(&mut self, name: &str) -> Result<Value> {
        QueueChannel::get::<Value>(self, name).await
    }

    async fn size(&mut self, name: &str) -> Result<u64> {
        QueueChannel::size(self, name).await
    }

    async fn purge(&mut self, name: &str) -> Result<u64> {
        QueueChannel::purge(self, name).await
    }

    async fn close(&mut self) {
        QueueChannel::close(self).await
    }
}
