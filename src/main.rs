use anyhow::{ Context, Result };
use fetch_cache::config::Config;
use fetch_cache::queue::FetchQueue;
use fetch_cache::registry::{ Prefetch, TaskRegistry };
use fetch_cache::shutdown::ShutdownFlag;
use fetch_cache::store::CacheStore;
use fetch_cache::sweeper::ExpirySweeper;
use fetch_cache::{ hn, logger };
use std::sync::Arc;
use std::time::Duration;

/// Demo binary: wires the cache together and warms it with the Hacker News
/// front page until Ctrl-C. Usage: `fetch-cache [config.json]`.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env
        ::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path)?;

    logger::init(&config.general.log_level);
    log::info!("fetch-cache starting (db: {})", config.database_path);

    let store = CacheStore::open(&config.database_path).context("Failed to open cache store")?;
    let queue = Arc::new(FetchQueue::new(&config.fetch).context("Failed to build fetch queue")?);
    let registry = TaskRegistry::new(store.clone(), queue, config.fetch.clone());

    let shutdown = ShutdownFlag::new();
    shutdown.listen_for_ctrl_c()?;

    let sweeper = ExpirySweeper::new(
        store.clone(),
        registry.clone(),
        config.sweep.clone(),
        shutdown.clone()
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    // Warm the front page: top story ids, then the first few story trees.
    while !shutdown.is_requested() {
        match registry.prefetch(&hn::top_stories_url()) {
            Ok(Prefetch::Cached(ids)) => warm_stories(&registry, &ids),
            Ok(Prefetch::Pending(rx)) => {
                if let Ok(Ok(ids)) = rx.await {
                    warm_stories(&registry, &ids);
                }
            }
            Err(e) => log::error!("Prefetch of top stories failed: {}", e),
        }

        log::info!(
            "{} tasks registered, {} rows persisted",
            registry.task_count(),
            store.count().map(|n| n.to_string()).unwrap_or_else(|_| "?".to_string())
        );
        shutdown.sleep(Duration::from_secs(10)).await;
    }

    sweeper_handle.await?;
    log::info!("fetch-cache stopped");
    Ok(())
}

fn warm_stories(registry: &Arc<TaskRegistry>, ids: &serde_json::Value) {
    let Some(ids) = ids.as_array() else {
        log::warn!("Top stories payload is not an array");
        return;
    };

    for id in ids.iter().take(10).filter_map(|id| id.as_u64()) {
        if let Err(e) = hn::get_story_recursively(registry, id) {
            log::error!("Failed to warm story {}: {}", id, e);
        }
    }
}
