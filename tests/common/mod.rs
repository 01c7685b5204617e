//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Tracing setup that honours `RUST_LOG`
//! - Document and config fixtures
//! - Fault-injecting source and destination wrappers

#![allow(dead_code)]

pub mod faults;

pub use faults::*;

use oplog_sync::{Document, SyncConfig};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

/// Install a fmt subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a document from a JSON object literal.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn user(id: i64, name: &str) -> Document {
    doc(json!({
        "_id": id,
        "name": name,
        "email": format!("{}@example.com", name.to_lowercase()),
    }))
}

/// Fast-timeout config backed by the given checkpoint path.
pub fn test_config(sqlite_path: &str) -> SyncConfig {
    SyncConfig::for_testing("mem://source", "mem://destination", sqlite_path)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
