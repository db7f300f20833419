use crate::error::FetchResult;
use crate::store::CacheRecord;
use serde_json::Value;
use std::sync::Arc;

/// Callback fired when an asynchronous download settles. Successful
/// downloads deliver the parsed value; parse and persistence failures
/// deliver the error (network failures never reach here, the queue retries
/// them internally).
pub type UpdateFn = Arc<dyn Fn(FetchResult<Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No payload yet.
    Empty,
    /// A download is outstanding; new callers attach to it.
    Downloading,
    /// Payload present and unexpired.
    Fresh,
    /// Payload present but expired.
    Stale,
    /// Record reference cleared by the sweeper; behaves as cold on next use.
    Evicted,
}

/// Cache and fetch state for exactly one url. The registry guards each task
/// with a mutex and guarantees at most one instance per url; this type only
/// holds state and transition rules, never I/O.
pub struct FetchTask {
    url: String,
    record_id: Option<i64>,
    last_value: Option<Value>,
    expires_at: i64,
    pending: bool,
    evicted: bool,
    waiters: Vec<UpdateFn>,
}

impl FetchTask {
    /// Cold construction: the registry has already inserted a placeholder
    /// row (empty payload, past expiry) for this url.
    pub fn cold(url: &str, record_id: i64) -> Self {
        Self {
            url: url.to_string(),
            record_id: Some(record_id),
            last_value: None,
            expires_at: 0,
            pending: false,
            evicted: false,
            waiters: Vec::new(),
        }
    }

    /// Warm construction from a persisted row. A row whose payload is NULL,
    /// empty, or no longer parses is treated as empty regardless of `exp`.
    pub fn from_record(url: &str, record: &CacheRecord) -> Self {
        let last_value = record.data
            .as_deref()
            .filter(|data| !data.is_empty())
            .and_then(|data| {
                match serde_json::from_str::<Value>(data) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        log::warn!("Ignoring unparseable cached payload for {}: {}", url, e);
                        None
                    }
                }
            });
        let expires_at = if last_value.is_some() { record.exp } else { 0 };

        Self {
            url: url.to_string(),
            record_id: Some(record.id),
            last_value,
            expires_at,
            pending: false,
            evicted: false,
            waiters: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn record_id(&self) -> Option<i64> {
        self.record_id
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    pub fn state(&self, now: i64) -> TaskState {
        if self.pending {
            TaskState::Downloading
        } else if self.evicted {
            TaskState::Evicted
        } else if self.last_value.is_none() {
            TaskState::Empty
        } else if self.expires_at >= now {
            TaskState::Fresh
        } else {
            TaskState::Stale
        }
    }

    /// Attach a callback to the next completed download.
    pub fn attach(&mut self, waiter: UpdateFn) {
        self.waiters.push(waiter);
    }

    /// Mark a download as outstanding. Exactly one caller wins this per
    /// download; everyone else attaches.
    pub fn begin_download(&mut self) {
        debug_assert!(!self.pending);
        self.pending = true;
    }

    /// Point the task at a (possibly re-created) persisted row.
    pub fn set_record_id(&mut self, id: i64) {
        self.record_id = Some(id);
        self.evicted = false;
    }

    /// Publish a successful download: new value, refreshed expiry, drained
    /// waiters returned for firing outside the lock.
    pub fn complete(&mut self, record_id: i64, value: Value, expires_at: i64) -> Vec<UpdateFn> {
        self.record_id = Some(record_id);
        self.last_value = Some(value);
        self.expires_at = expires_at;
        self.pending = false;
        self.evicted = false;
        std::mem::take(&mut self.waiters)
    }

    /// Abandon the outstanding download, reverting to the pre-download
    /// state so a later fetch retries. Waiters are returned so the failure
    /// can be delivered outside the lock.
    pub fn fail(&mut self) -> Vec<UpdateFn> {
        self.pending = false;
        std::mem::take(&mut self.waiters)
    }

    /// Clear the record reference and value. The task stays in the registry
    /// as a cold sentinel; the next access re-creates the row.
    pub fn evict(&mut self) {
        self.record_id = None;
        self.last_value = None;
        self.expires_at = 0;
        self.evicted = true;
    }
}
