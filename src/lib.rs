#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Trunk
//!
//! Durable message queue on plain PostgreSQL.
//!
//! ## Overview
//!
//! Messages live in an ordinary table and are claimed with
//! `FOR UPDATE SKIP LOCKED`, so every message goes to exactly one consumer
//! no matter how many compete. `LISTEN/NOTIFY` rides on top purely as a
//! wake-up signal: an idle consumer sleeps on its socket instead of
//! polling, and a lost notification costs latency, never a message.
//!
//! ## Module Organization
//!
//! - [`queue`] - Locking queue: `put`, `get`, `qsize`, `purge`
//! - [`notify`] - LISTEN/NOTIFY client with a blocking, deadline-bounded wait
//! - [`connection`] - Single-session connection that health-checks itself and
//!   replaces itself after failures or failover to a read-only server
//! - [`audit`] - Per-statement timing and transaction boundary logging
//! - [`transport`] - JSON channel for messaging frameworks
//! - [`dsn`] - Connection URLs from discrete parts
//! - [`retry`] - Fixed-delay retry helper
//! - [`config`] - Layered configuration
//! - [`logging`] - `tracing-subscriber` setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trunk::config::TrunkConfig;
//! use trunk::queue::PgQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrunkConfig::load()?;
//! let mut queue = PgQueue::connect(&config).await?;
//!
//! queue.create("emails").await;
//! queue.put("emails", b"hello").await?;
//!
//! match queue.get("emails", true, Some(Duration::from_secs(5))).await {
//!     Ok(message) => println!("claimed #{}", message.id),
//!     Err(e) if e.is_empty() => println!("nothing yet"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests run without a database. Integration tests need PostgreSQL at
//! `DATABASE_URL` and the `test-db` feature:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/trunk_test cargo test --features test-db
//! ```

pub mod audit;
pub mod config;
pub mod connection;
pub mod dsn;
pub mod error;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod transport;

pub use audit::{AuditSink, SharedSink, TracingSink, TransactionStatus};
pub use crate::config::TrunkConfig;
pub use connection::{ConnectionSettings, ConnectionState, ResilientConnection, Session};
pub use dsn::ConnectionDescriptor;
pub use error::{Result, TrunkError};
pub use notify::{Notification, NotificationClient};
pub use queue::{Message, PgQueue};
pub use retry::{retry, RetryPolicy};
pub use transport::{QueueChannel, VirtualChannel};
