//! Drains a small in-memory queue with two workers
//!
//! Run with: RUST_LOG=info cargo run -p reconcile-queue --example in_memory_sync
//!
//! Settings are read from `SYNC_QUEUE_*` variables (a `.env` file is loaded
//! if present).

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reconcile_queue::prelude::*;

#[derive(Debug, Deserialize)]
struct Product {
    sku: String,
    price_cents: i64,
}

/// Pretends to write products into a local catalog
struct ProductHandler;

#[async_trait]
impl EntityHandler for ProductHandler {
    async fn sync(
        &self,
        payload: &serde_json::Value,
        operation: OperationType,
    ) -> Result<SyncOutcome, HandlerError> {
        let product: Product = serde_json::from_value(payload.clone())?;

        if product.price_cents < 0 {
            return Err(HandlerError::validation(format!(
                "negative price for {}",
                product.sku
            )));
        }
        if product.sku.ends_with("-flaky") {
            return Err(HandlerError::timeout("catalog did not answer"));
        }

        info!(sku = %product.sku, %operation, "Applied product");
        Ok(SyncOutcome::new(format!("catalog-{}", product.sku)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reconcile_queue=debug,in_memory_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = QueueConfig::from_env()
        .with_poll_interval(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(20), Duration::from_millis(200));

    let store = Arc::new(InMemoryQueueStore::from_config(&config));

    for (sku, price) in [("A-100", 1299), ("B-200", -5), ("C-300-flaky", 450), ("D-400", 99)] {
        store
            .enqueue(NewQueueEntry::new(
                "product",
                sku,
                OperationType::Update,
                serde_json::json!({"sku": sku, "price_cents": price}),
            ))
            .await?;
    }

    let mut registry = HandlerRegistry::new();
    registry.register("product", Arc::new(ProductHandler));

    let manager = WorkerManager::new(
        StoreHandles::shared(store.clone()),
        Arc::new(registry),
        config.clone(),
    );

    let depth = manager
        .scoped(config.worker_count, async {
            loop {
                let depth = store.depth().await?;
                if depth.outstanding() == 0 {
                    return anyhow::Ok(depth);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await?;

    info!(?depth, stats = ?manager.stats(), "Queue drained");

    for entry in store.list_dead_lettered(10).await? {
        info!(
            source_entity_id = %entry.source_entity_id,
            attempts = entry.attempt_count,
            error = entry.error_message.as_deref().unwrap_or_default(),
            "Dead-lettered"
        );
    }

    Ok(())
}
