use crate::config::SweepConfig;
use crate::registry::TaskRegistry;
use crate::shutdown::ShutdownFlag;
use crate::store::CacheStore;
use crate::utils::now_millis;
use std::sync::Arc;
use std::time::{ Duration, Instant };

/// Background loop that deletes expired cache rows in batches and evicts
/// the matching fetch tasks.
///
/// The batch size self-tunes around a wall-time budget so sweeping expands
/// under backlog and backs off to the idle interval when there is nothing
/// to do — it never monopolizes the shared store connection. The adaptive
/// limit lives here and nowhere else.
pub struct ExpirySweeper {
    store: CacheStore,
    registry: Arc<TaskRegistry>,
    config: SweepConfig,
    shutdown: ShutdownFlag,
}

impl ExpirySweeper {
    pub fn new(
        store: CacheStore,
        registry: Arc<TaskRegistry>,
        config: SweepConfig,
        shutdown: ShutdownFlag
    ) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown,
        }
    }

    /// Run until shutdown. Each iteration performs one sweep step, then
    /// sleeps the interval the step selected.
    pub async fn run(self) {
        log::info!(
            "Sweeper started (initial limit {}, budget {:?})",
            self.config.initial_limit,
            self.config.time_budget()
        );

        let mut limit = self.config.initial_limit;
        while !self.shutdown.is_requested() {
            let (next, sleep) = self.sweep_once(limit);
            limit = next;
            self.shutdown.sleep(sleep).await;
        }

        log::info!("Sweeper stopped");
    }

    /// One sweep step: delete up to `limit` expired rows (evicting their
    /// tasks inside the same transaction) and pick the next limit and
    /// sleep. Store failures end the cycle but are retried after the busy
    /// interval; they never propagate into fetch paths.
    pub fn sweep_once(&self, limit: usize) -> (usize, Duration) {
        let start = Instant::now();
        let removed = match
            self.store.sweep_expired(now_millis(), limit, |url| self.registry.expire(url))
        {
            Ok(removed) => removed,
            Err(e) => {
                log::error!("Sweep step failed: {}", e);
                return (limit, self.config.busy_interval());
            }
        };

        if removed > 0 {
            log::debug!("Swept {} expired rows (limit {}) in {:?}", removed, limit, start.elapsed());
        }

        next_limit(&self.config, limit, start.elapsed(), removed)
    }
}

/// Adaptive batch policy. An empty batch resets the limit and selects the
/// idle sleep; otherwise the limit halves when the step blew its time
/// budget, doubles when it finished in under half of it, and grows 1.5x in
/// between, clamped to the configured maximum.
pub fn next_limit(
    config: &SweepConfig,
    limit: usize,
    elapsed: Duration,
    removed: usize
) -> (usize, Duration) {
    if removed == 0 {
        return (config.initial_limit, config.idle_interval());
    }

    let budget = config.time_budget();
    let next = if elapsed > budget {
        limit / 2 + 1
    } else if elapsed < budget / 2 {
        limit.saturating_mul(2)
    } else {
        limit.saturating_mul(3) / 2
    };

    (next.clamp(1, config.max_limit), config.busy_interval())
}
