use crate::error::{ FetchError, FetchResult };
use rusqlite::{ Connection, OptionalExtension, params };
use std::path::Path;
use std::sync::{ Arc, Mutex };

/// One persisted cache row. `exp` is unix millis; `data` is the raw JSON
/// body and stays NULL until the first successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub id: i64,
    pub url: String,
    pub exp: i64,
    pub data: Option<String>,
}

/// SQLite-backed record store. The connection is a single serialized
/// resource shared by the fetch path and the sweeper.
#[derive(Debug, Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub fn open(path: &str) -> FetchResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e|
                    FetchError::Store(format!("Failed to create {}: {}", parent.display(), e))
                )?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> FetchResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> FetchResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                exp INTEGER NOT NULL,
                data TEXT
            )",
            []
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_cache_exp ON cache(exp)", [])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Exact lookup by url.
    pub fn find_by_url(&self, url: &str) -> FetchResult<Option<CacheRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, url, exp, data FROM cache WHERE url = ?1",
                params![url],
                |row| {
                    Ok(CacheRecord {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        exp: row.get(2)?,
                        data: row.get(3)?,
                    })
                }
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a row for `url`, returning its id. If a row for the url
    /// already exists (a racing creator or a payload landing after
    /// eviction) it is updated in place instead.
    pub fn insert(&self, url: &str, exp: i64, data: Option<&str>) -> FetchResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cache (url, exp, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(url) DO UPDATE SET exp = excluded.exp, data = excluded.data",
            params![url, exp, data]
        )?;
        let id: i64 = conn.query_row("SELECT id FROM cache WHERE url = ?1", params![url], |row|
            row.get(0)
        )?;
        Ok(id)
    }

    /// Update payload and expiry in place. Returns false when the row is
    /// gone (swept mid-flight); the caller re-inserts in that case.
    pub fn update(&self, id: i64, exp: i64, data: &str) -> FetchResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("UPDATE cache SET exp = ?2, data = ?3 WHERE id = ?1", params![
            id,
            exp,
            data
        ])?;
        Ok(changed > 0)
    }

    /// Refresh only the expiry, used to stamp a row when a download starts.
    pub fn touch_exp(&self, id: i64, exp: i64) -> FetchResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("UPDATE cache SET exp = ?2 WHERE id = ?1", params![id, exp])?;
        Ok(changed > 0)
    }

    pub fn delete_by_id(&self, id: i64) -> FetchResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM cache WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Number of rows currently persisted.
    pub fn count(&self) -> FetchResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// One sweep step: select up to `limit` expired rows ordered by expiry,
    /// report each url through `on_evict`, delete them, all in a single
    /// transaction so the batch cannot interleave with a concurrent
    /// insert/update of the same rows. Returns the number of rows removed.
    ///
    /// `on_evict` must not touch the store; it runs while the connection is
    /// held.
    pub fn sweep_expired(
        &self,
        now: i64,
        limit: usize,
        mut on_evict: impl FnMut(&str)
    ) -> FetchResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, url FROM cache WHERE exp < ?1 ORDER BY exp ASC LIMIT ?2"
            )?;
            let mapped = stmt.query_map(params![now, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        for (id, url) in &rows {
            on_evict(url);
            tx.execute("DELETE FROM cache WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(rows.len())
    }
}
