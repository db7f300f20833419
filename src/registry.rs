use crate::config::FetchConfig;
use crate::error::{ FetchError, FetchResult };
use crate::queue::FetchQueue;
use crate::store::CacheStore;
use crate::task::{ FetchTask, TaskState, UpdateFn };
use crate::utils::now_millis;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use tokio::sync::oneshot;

type TaskHandle = Arc<Mutex<FetchTask>>;

/// Outcome of a `prefetch` call: either a value that was already available,
/// or a handle resolving when the started download completes.
pub enum Prefetch {
    Cached(Value),
    Pending(oneshot::Receiver<FetchResult<Value>>),
}

/// Owns the url -> task table and drives downloads through the queue.
///
/// Guarantees exactly one `FetchTask` per url at any instant, so all
/// concurrent callers for a url observe the same in-flight download
/// (single-flight). Injected wherever fetching is needed; there is no
/// ambient global table.
///
/// Lock discipline: the store's connection mutex is never taken while a
/// task or table lock is held. This is what lets the sweeper call
/// [`TaskRegistry::expire`] from inside its store transaction.
pub struct TaskRegistry {
    store: CacheStore,
    queue: Arc<FetchQueue>,
    config: FetchConfig,
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new(store: CacheStore, queue: Arc<FetchQueue>, config: FetchConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            config,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Synchronous best-effort read. Returns the current value immediately
    /// (None when cold) and, when the value is stale or absent, starts or
    /// joins a background download whose outcome reaches `on_update`.
    ///
    /// Network conditions never surface here; store failures do.
    pub fn fetch(self: &Arc<Self>, url: &str, on_update: UpdateFn) -> FetchResult<Option<Value>> {
        let now = now_millis();
        let handle = self.lookup_or_create(url)?;

        let (starts_download, value) = {
            let mut task = handle.lock().unwrap();
            match task.state(now) {
                TaskState::Fresh => (false, task.last_value().cloned()),
                TaskState::Downloading => {
                    task.attach(on_update);
                    (false, task.last_value().cloned())
                }
                TaskState::Empty | TaskState::Stale | TaskState::Evicted => {
                    task.begin_download();
                    task.attach(on_update);
                    (true, task.last_value().cloned())
                }
            }
        };

        if starts_download {
            if let Err(e) = self.arm_download(&handle, now) {
                // The row could not be stamped; undo the claim so a later
                // call retries, and surface the store failure.
                handle.lock().unwrap().fail();
                return Err(e);
            }
            self.spawn_download(url.to_string(), handle);
        }

        Ok(value)
    }

    /// Warm the cache for `url` without needing a notification. Returns the
    /// value when one is already available, otherwise a completion handle
    /// for the download this call started or joined.
    pub fn prefetch(self: &Arc<Self>, url: &str) -> FetchResult<Prefetch> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let on_update: UpdateFn = Arc::new(move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        });

        match self.fetch(url, on_update)? {
            Some(value) => Ok(Prefetch::Cached(value)),
            None => Ok(Prefetch::Pending(rx)),
        }
    }

    /// Evict the task for `url`, clearing its record reference and value.
    /// The task stays registered as a cold sentinel; a url with no task is
    /// a no-op. Called by the sweeper for each row it deletes.
    pub fn expire(&self, url: &str) {
        let tasks = self.tasks.lock().unwrap();
        if let Some(handle) = tasks.get(url) {
            handle.lock().unwrap().evict();
            log::debug!("Evicted fetch task for {}", url);
        }
    }

    /// Number of tasks currently registered (evicted sentinels included).
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn has_task(&self, url: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(url)
    }

    /// Find the task for `url`, creating it from the persisted row — or a
    /// freshly inserted placeholder row (empty payload, past expiry) — when
    /// it does not exist yet.
    fn lookup_or_create(&self, url: &str) -> FetchResult<TaskHandle> {
        if let Some(handle) = self.tasks.lock().unwrap().get(url) {
            return Ok(handle.clone());
        }

        // Cold path: consult the store with no table lock held, then have
        // racing creators converge onto whichever task landed first.
        let task = match self.store.find_by_url(url)? {
            Some(record) => FetchTask::from_record(url, &record),
            None => {
                let id = self.store.insert(url, 0, None)?;
                FetchTask::cold(url, id)
            }
        };

        let mut tasks = self.tasks.lock().unwrap();
        let handle = tasks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(task)))
            .clone();
        Ok(handle)
    }

    /// Stamp the persisted row with the in-flight placeholder TTL,
    /// re-creating the row when the sweeper removed it (or the task was
    /// evicted). Runs with no task lock held.
    fn arm_download(&self, handle: &TaskHandle, now: i64) -> FetchResult<()> {
        let exp = now + self.config.placeholder_ttl_ms;
        let (url, record_id) = {
            let task = handle.lock().unwrap();
            (task.url().to_string(), task.record_id())
        };

        let stamped = match record_id {
            Some(id) => self.store.touch_exp(id, exp)?.then_some(id),
            None => None,
        };
        let id = match stamped {
            Some(id) => id,
            None => self.store.insert(&url, exp, None)?,
        };

        handle.lock().unwrap().set_record_id(id);
        Ok(())
    }

    /// Run the download to completion on the runtime. The queue retries
    /// network failures forever, so the only terminal failures here are
    /// parse and persistence errors, which reach the attached waiters.
    fn spawn_download(self: &Arc<Self>, url: String, handle: TaskHandle) {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let expire_ttl = self.config.expire_ttl_ms;

        tokio::spawn(async move {
            let body = queue.get_text_retrying(&url).await;
            let now = now_millis();

            let value = match serde_json::from_str::<Value>(&body) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("Discarding malformed payload from {}: {}", url, e);
                    let error = FetchError::Parse {
                        url: url.clone(),
                        reason: e.to_string(),
                    };
                    let waiters = handle.lock().unwrap().fail();
                    for waiter in waiters {
                        waiter(Err(error.clone()));
                    }
                    return;
                }
            };

            let exp = now + expire_ttl;
            let record_id = handle.lock().unwrap().record_id();
            let persisted = (|| -> FetchResult<i64> {
                if let Some(id) = record_id {
                    if store.update(id, exp, &body)? {
                        return Ok(id);
                    }
                }
                // Row swept (or task evicted) mid-flight: new row, new id.
                store.insert(&url, exp, Some(&body))
            })();

            match persisted {
                Ok(id) => {
                    let waiters = {
                        let mut task = handle.lock().unwrap();
                        task.complete(id, value.clone(), exp)
                    };
                    // Fired outside the lock: a callback may call fetch again.
                    for waiter in waiters {
                        waiter(Ok(value.clone()));
                    }
                }
                Err(e) => {
                    log::error!("Failed to persist payload for {}: {}", url, e);
                    let waiters = handle.lock().unwrap().fail();
                    for waiter in waiters {
                        waiter(Err(e.clone()));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::queue::TextFetcher;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::time::Duration;

    fn test_config() -> FetchConfig {
        FetchConfig {
            spacing_ms: 1,
            retry_cooldown_ms: 5,
            request_timeout_secs: 5,
            placeholder_ttl_ms: 5_000,
            expire_ttl_ms: 30_000,
        }
    }

    /// Replays scripted responses, then keeps returning the last one.
    /// Counts upstream requests and can delay each response.
    struct ScriptedFetcher {
        responses: Mutex<VecDeque<FetchResult<String>>>,
        fallback: String,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn ok(body: &str) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: body.to_string(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn script(self, responses: Vec<FetchResult<String>>) -> Self {
            *self.responses.lock().unwrap() = responses.into();
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextFetcher for ScriptedFetcher {
        async fn fetch_text(&self, _url: &str) -> FetchResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn registry_with(fetcher: Arc<ScriptedFetcher>) -> (Arc<TaskRegistry>, CacheStore) {
        let config = test_config();
        let store = CacheStore::open_in_memory().unwrap();
        let queue = Arc::new(FetchQueue::with_fetcher(fetcher, &config));
        (TaskRegistry::new(store.clone(), queue, config), store)
    }

    fn counting_callback() -> (UpdateFn, Arc<Mutex<Vec<FetchResult<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: UpdateFn = Arc::new(move |result| {
            sink.lock().unwrap().push(result);
        });
        (callback, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn cold_fetch_returns_placeholder_then_notifies_once() {
        // Scenario A.
        let fetcher = Arc::new(ScriptedFetcher::ok("{\"a\":1}"));
        let (registry, store) = registry_with(fetcher.clone());
        let (callback, seen) = counting_callback();

        let before = now_millis();
        let value = registry.fetch("https://x/1", callback).unwrap();
        assert_eq!(value, None);

        // The placeholder row exists immediately, payload still empty.
        let placeholder = store.find_by_url("https://x/1").unwrap().unwrap();
        assert_eq!(placeholder.data, None);

        settle().await;
        let after = now_millis();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap(), &json!({"a": 1}));

        let record = store.find_by_url("https://x/1").unwrap().unwrap();
        assert_eq!(record.data.as_deref(), Some("{\"a\":1}"));
        // exp == completion time + expire TTL, bracketed by the test window.
        assert!(record.exp >= before + 30_000);
        assert!(record.exp <= after + 30_000);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_download() {
        // Scenario B / single-flight.
        let fetcher = Arc::new(
            ScriptedFetcher::ok("{\"v\":42}").with_delay(Duration::from_millis(40))
        );
        let (registry, _store) = registry_with(fetcher.clone());

        let (cb1, seen1) = counting_callback();
        let (cb2, seen2) = counting_callback();

        assert_eq!(registry.fetch("https://x/2", cb1).unwrap(), None);
        assert_eq!(registry.fetch("https://x/2", cb2).unwrap(), None);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(seen1.lock().unwrap().len(), 1);
        assert_eq!(seen2.lock().unwrap().len(), 1);
        assert_eq!(
            seen1.lock().unwrap()[0].as_ref().unwrap(),
            seen2.lock().unwrap()[0].as_ref().unwrap()
        );
        assert_eq!(registry.task_count(), 1);
    }

    #[tokio::test]
    async fn fresh_value_issues_no_request() {
        // Idempotence.
        let fetcher = Arc::new(ScriptedFetcher::ok("{\"a\":1}"));
        let (registry, _store) = registry_with(fetcher.clone());

        let (cb, _) = counting_callback();
        registry.fetch("https://x/3", cb).unwrap();
        settle().await;
        assert_eq!(fetcher.calls(), 1);

        let (cb, seen) = counting_callback();
        let value = registry.fetch("https://x/3", cb).unwrap();
        settle().await;

        assert_eq!(value, Some(json!({"a": 1})));
        assert_eq!(fetcher.calls(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_value_returned_immediately_and_refreshed() {
        let fetcher = Arc::new(
            ScriptedFetcher::ok("{\"new\":true}")
        );
        let config = test_config();
        let store = CacheStore::open_in_memory().unwrap();
        store.insert("https://x/4", now_millis() - 1000, Some("{\"old\":true}")).unwrap();
        let queue = Arc::new(FetchQueue::with_fetcher(fetcher.clone(), &config));
        let registry = TaskRegistry::new(store.clone(), queue, config);

        let (cb, seen) = counting_callback();
        let value = registry.fetch("https://x/4", cb).unwrap();
        assert_eq!(value, Some(json!({"old": true})));

        settle().await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(seen.lock().unwrap()[0].as_ref().unwrap(), &json!({"new": true}));

        let record = store.find_by_url("https://x/4").unwrap().unwrap();
        assert_eq!(record.data.as_deref(), Some("{\"new\":true}"));
    }

    #[tokio::test]
    async fn expire_on_unknown_url_is_noop() {
        // Scenario C.
        let fetcher = Arc::new(ScriptedFetcher::ok("{}"));
        let (registry, _store) = registry_with(fetcher);
        registry.expire("https://x/never-fetched");
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn evicted_task_cold_starts_with_new_row() {
        // Pins open-question choice (b): the sentinel task survives
        // eviction and the next access creates a brand-new row.
        let fetcher = Arc::new(ScriptedFetcher::ok("{\"a\":1}"));
        let (registry, store) = registry_with(fetcher.clone());

        let (cb, _) = counting_callback();
        registry.fetch("https://x/5", cb).unwrap();
        settle().await;
        let old_id = store.find_by_url("https://x/5").unwrap().unwrap().id;

        // Sweeper behavior: delete the row, then evict the task.
        store.delete_by_id(old_id).unwrap();
        registry.expire("https://x/5");
        assert!(registry.has_task("https://x/5"));

        let (cb, seen) = counting_callback();
        let value = registry.fetch("https://x/5", cb).unwrap();
        assert_eq!(value, None); // cold again
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        let record = store.find_by_url("https://x/5").unwrap().unwrap();
        assert_ne!(record.id, old_id);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_parse_error_and_stays_retryable() {
        let fetcher = Arc::new(
            ScriptedFetcher::ok("{\"fixed\":true}").script(vec![Ok("not json".to_string())])
        );
        let (registry, store) = registry_with(fetcher.clone());

        let (cb, seen) = counting_callback();
        registry.fetch("https://x/6", cb).unwrap();
        settle().await;

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert!(matches!(seen[0], Err(FetchError::Parse { .. })));
        }
        // Nothing persisted beyond the placeholder.
        let record = store.find_by_url("https://x/6").unwrap().unwrap();
        assert_eq!(record.data, None);

        // A later fetch retries and succeeds.
        let (cb, seen) = counting_callback();
        registry.fetch("https://x/6", cb).unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap()[0].as_ref().unwrap(), &json!({"fixed": true}));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn prefetch_returns_cached_or_pending() {
        let fetcher = Arc::new(ScriptedFetcher::ok("{\"p\":1}"));
        let (registry, _store) = registry_with(fetcher.clone());

        let pending = registry.prefetch("https://x/7").unwrap();
        let value = match pending {
            Prefetch::Pending(rx) => rx.await.unwrap().unwrap(),
            Prefetch::Cached(_) => panic!("cold prefetch cannot be cached"),
        };
        assert_eq!(value, json!({"p": 1}));

        match registry.prefetch("https://x/7").unwrap() {
            Prefetch::Cached(value) => assert_eq!(value, json!({"p": 1})),
            Prefetch::Pending(_) => panic!("warm prefetch must be cached"),
        }
        assert_eq!(fetcher.calls(), 1);
    }
}
