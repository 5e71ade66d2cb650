//! Live Query Sync demo.
//!
//! Runs a todo list against the in-memory backend: an optimistic update that
//! the backend confirms, and one that it rejects.

use livequery_engine::query::{col, eq, val, Query};
use livequery_engine::{field_key, CollectionConfig, Key, Store};
use livequery_sync::logging::init_tracing;
use livequery_sync::{Config, MemoryBackend, TransactionExecutor};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    tracing::info!(
        txid_timeout_ms = config.txid_timeout.as_millis() as u64,
        refetch_timeout_ms = config.refetch_timeout.as_millis() as u64,
        "Starting livequery demo"
    );

    // Seed the backend
    let backend = MemoryBackend::new();
    let table = backend.table("todos", "id");
    backend.server_upsert("todos", json!({"id": "1", "text": "a", "done": false}))?;

    // Collections
    let store = Store::new();
    let todos = store.create_collection(
        CollectionConfig::new("todos", field_key("id")).with_source(table.into_source()),
    )?;
    let active =
        store.live_query(Query::from("t", &todos).filter(eq(col("t", "done"), val(false))))?;
    let _log = active.subscribe(|changes| {
        for change in &changes.changes {
            tracing::info!(key = %change.key, change = ?change.change_type, "activeTodos");
        }
    });
    todos.preload().await?;

    let executor = TransactionExecutor::new(backend.clone(), config);
    let key = Key::from("1");

    // Confirmed update
    let mut tx = store.transaction();
    tx.update(&todos, &key, |row| row["done"] = json!(true))?;
    tracing::info!(row = ?todos.get(&key), "Optimistic");
    let report = executor.commit(tx).await?;
    tracing::info!(txids = ?report.txids, row = ?todos.synced_value(&key), "Confirmed");

    // Rejected update
    backend.fail_next_mutation("NetworkError");
    let mut tx = store.transaction();
    tx.update(&todos, &key, |row| row["text"] = json!("b"))?;
    match executor.commit(tx).await {
        Ok(_) => tracing::warn!("Expected the backend to reject the write"),
        Err(err) => tracing::info!(error = %err, row = ?todos.get(&key), "Rolled back"),
    }

    tracing::info!(active = active.len(), todos = todos.len(), "Done");
    Ok(())
}
