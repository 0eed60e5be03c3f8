//! gophermart-pipeline: accrual reconciliation worker
//!
//! Runs the ingest buffer, accrual adapter, reconciler, DLQ sanitizer and
//! stale-order sweep in one process over in-memory queues.
//!
//! ## Architecture
//! ```text
//! pending --> [adapter] --HTTP--> accrual service
//!                 |
//!                 v
//!             verdicts --> [reconciler] --> SQLite (orders, balances, ledger)
//!                 |
//!                 v
//!           dead letters --> [sanitizer] --> pending
//! ```
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   type: sqlite
//!   path: /var/lib/gophermart/gophermart.db
//! oracle:
//!   address: http://localhost:8080
//! adapter:
//!   workers: 4
//! sanitizer:
//!   cooldown_ms: 60000
//!   max_attempts: 30
//! ```
//!
//! - GOPHERMART_CONFIG: path to a YAML config file
//! - GOPHERMART__SECTION__KEY: per-key overrides
//! - ACCRUAL_SYSTEM_ADDRESS / DATABASE_URI: legacy overrides
//! - GOPHERMART_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::info;

use gophermart::config::Config;
use gophermart::oracle::HttpAccrualClient;
use gophermart::pipeline::{Pipeline, Queues};
use gophermart::storage::init_storage;
use gophermart::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let (orders, dead_letters) = init_storage(&config.storage).await?;
    let oracle = Arc::new(HttpAccrualClient::new(config.oracle.clone())?);
    let queues = Queues::in_memory(&config.queues);

    info!(oracle = %config.oracle.address, "gophermart-pipeline starting");

    let pipeline = Pipeline::start(&config, orders, dead_letters, oracle, queues)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    pipeline.shutdown().await;
    Ok(())
}
