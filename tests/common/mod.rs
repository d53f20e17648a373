#![allow(dead_code)]

pub mod strategies;

pub use trunk::audit::RecordingSink;

use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use trunk::audit::SharedSink;
use trunk::connection::ConnectionSettings;
use trunk::queue::PgQueue;
use trunk::retry::RetryPolicy;

/// Generate a unique queue or channel name for test data
pub fn unique_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &suffix[..12])
}

/// Settings with short delays so failing tests fail quickly
pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        readonly_attempts: 2,
        reconnect: RetryPolicy::fixed(2, Duration::from_millis(50)),
        autocommit: true,
        connect_timeout: Duration::from_secs(5),
    }
}

pub async fn queue_client(options: &PgConnectOptions) -> PgQueue {
    queue_client_with(options, fast_settings(), trunk::audit::default_sink()).await
}

pub async fn queue_client_with(
    options: &PgConnectOptions,
    settings: ConnectionSettings,
    sink: SharedSink,
) -> PgQueue {
    PgQueue::from_options(options.clone(), settings, sink)
        .await
        .expect("queue client should connect")
}
