//! Keel persistence: keyed record store for managed resources.
//! Read one by uniqid, update fields by uniqid. Keep it small.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use keel_core::{normalize_labels, Labels, ManagedResource, ResourceState};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fields written together in one atomic update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcePatch {
    pub state: Option<ResourceState>,
    pub attempt_times: Option<u32>,
    pub message: Option<String>,
}

impl ResourcePatch {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.attempt_times.is_none() && self.message.is_none()
    }

    fn apply_to(&self, r: &mut ManagedResource) {
        if let Some(s) = self.state {
            r.state = s;
        }
        if let Some(n) = self.attempt_times {
            r.attempt_times = n;
        }
        if let Some(m) = &self.message {
            r.message = Some(m.clone());
        }
    }
}

/// Result of one atomically recorded failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempts: u32,
    /// `Failed` once `attempts` reaches the threshold, else `Pending`.
    pub state: ResourceState,
    pub desired_state: ResourceState,
}

impl AttemptRecord {
    fn decide(attempts: u32, threshold: u32, desired_state: ResourceState) -> Self {
        let state = if attempts >= threshold { ResourceState::Failed } else { ResourceState::Pending };
        Self { attempts, state, desired_state }
    }
}

pub trait ResourceStore: Send + Sync {
    fn get(&self, uniqid: &str) -> Result<Option<ManagedResource>>;
    /// Apply every field of `patch` at once. Returns false when no record matched.
    fn update(&self, uniqid: &str, patch: &ResourcePatch) -> Result<bool>;
    fn put(&self, resource: &ManagedResource) -> Result<()>;
    fn list_by_state(&self, state: ResourceState) -> Result<Vec<ManagedResource>>;
    /// Increment `attempt_times` and set the resulting state in one step.
    /// Returns `None` when no record matched.
    fn record_attempt(&self, uniqid: &str, threshold: u32) -> Result<Option<AttemptRecord>>;
}

impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    fn get(&self, uniqid: &str) -> Result<Option<ManagedResource>> {
        (**self).get(uniqid)
    }
    fn update(&self, uniqid: &str, patch: &ResourcePatch) -> Result<bool> {
        (**self).update(uniqid, patch)
    }
    fn put(&self, resource: &ManagedResource) -> Result<()> {
        (**self).put(resource)
    }
    fn list_by_state(&self, state: ResourceState) -> Result<Vec<ManagedResource>> {
        (**self).list_by_state(state)
    }
    fn record_attempt(&self, uniqid: &str, threshold: u32) -> Result<Option<AttemptRecord>> {
        (**self).record_attempt(uniqid, threshold)
    }
}

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

const COLUMNS: &str = "uniqid, name, appkey, channel, resource_type, desired_state, state, attempt_times, labels, message";

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(dir) = std::path::Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db, started)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, std::time::Instant::now())
    }

    fn init(db: rusqlite::Connection, started: std::time::Instant) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS managed_resources (
                uniqid        TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                appkey        TEXT NOT NULL,
                channel       TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                desired_state TEXT NOT NULL,
                state         TEXT NOT NULL,
                attempt_times INTEGER NOT NULL DEFAULT 0,
                labels        TEXT NOT NULL DEFAULT '{}',
                message       TEXT,
                updated_at    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating managed_resources table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_managed_resources_state ON managed_resources(state)", [])
            .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

struct RawRow {
    uniqid: String,
    name: String,
    appkey: String,
    channel: String,
    resource_type: String,
    desired_state: String,
    state: String,
    attempt_times: i64,
    labels: String,
    message: Option<String>,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uniqid: row.get(0)?,
            name: row.get(1)?,
            appkey: row.get(2)?,
            channel: row.get(3)?,
            resource_type: row.get(4)?,
            desired_state: row.get(5)?,
            state: row.get(6)?,
            attempt_times: row.get(7)?,
            labels: row.get(8)?,
            message: row.get(9)?,
        })
    }

    fn into_resource(self) -> Result<ManagedResource> {
        Ok(ManagedResource {
            resource_type: self.resource_type.parse()?,
            desired_state: self.desired_state.parse()?,
            state: self.state.parse()?,
            attempt_times: u32::try_from(self.attempt_times.max(0)).unwrap_or(u32::MAX),
            labels: decode_labels(&self.labels),
            uniqid: self.uniqid,
            name: self.name,
            appkey: self.appkey,
            channel: self.channel,
            message: self.message,
        })
    }
}

fn decode_labels(raw: &str) -> Labels {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(m)) => normalize_labels(&m),
        _ => Labels::new(),
    }
}

impl ResourceStore for SqliteStore {
    fn get(&self, uniqid: &str) -> Result<Option<ManagedResource>> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!("SELECT {} FROM managed_resources WHERE uniqid = ?1", COLUMNS))?;
        let mut rows = stmt.query([uniqid])?;
        let out = match rows.next()? {
            Some(row) => Some(RawRow::read(row)?.into_resource().with_context(|| format!("decoding resource {}", uniqid))?),
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn update(&self, uniqid: &str, patch: &ResourcePatch) -> Result<bool> {
        use rusqlite::types::Value;
        if patch.is_empty() {
            return Ok(self.get(uniqid)?.is_some());
        }
        let started = std::time::Instant::now();
        let mut sets: Vec<&str> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(s) = patch.state {
            sets.push("state = ?");
            params.push(Value::Text(s.as_str().to_string()));
        }
        if let Some(n) = patch.attempt_times {
            sets.push("attempt_times = ?");
            params.push(Value::Integer(i64::from(n)));
        }
        if let Some(m) = &patch.message {
            sets.push("message = ?");
            params.push(Value::Text(m.clone()));
        }
        sets.push("updated_at = ?");
        params.push(Value::Integer(now_ts()));
        params.push(Value::Text(uniqid.to_string()));
        let sql = format!("UPDATE managed_resources SET {} WHERE uniqid = ?", sets.join(", "));

        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let changed = tx.execute(&sql, rusqlite::params_from_iter(params))?;
        tx.commit()?;
        histogram!("persist_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_update_total", 1u64);
        debug!(uniqid = %uniqid, changed, "resource updated");
        Ok(changed > 0)
    }

    fn put(&self, r: &ManagedResource) -> Result<()> {
        let labels = serde_json::to_string(&r.labels)?;
        let db = self.lock()?;
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO managed_resources ({}, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                COLUMNS
            ),
            rusqlite::params![
                r.uniqid,
                r.name,
                r.appkey,
                r.channel,
                r.resource_type.as_str(),
                r.desired_state.as_str(),
                r.state.as_str(),
                i64::from(r.attempt_times),
                labels,
                r.message,
                now_ts(),
            ],
        )
        .with_context(|| format!("storing resource {}", r.uniqid))?;
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn list_by_state(&self, state: ResourceState) -> Result<Vec<ManagedResource>> {
        let db = self.lock()?;
        let mut stmt =
            db.prepare(&format!("SELECT {} FROM managed_resources WHERE state = ?1 ORDER BY uniqid", COLUMNS))?;
        let raws = stmt.query_map([state.as_str()], RawRow::read)?.collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRow::into_resource).collect()
    }

    fn record_attempt(&self, uniqid: &str, threshold: u32) -> Result<Option<AttemptRecord>> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        // SET expressions see the pre-update row, so both read the old count.
        let row = tx
            .query_row(
                "UPDATE managed_resources
                 SET attempt_times = attempt_times + 1,
                     state = CASE WHEN attempt_times + 1 >= ?1 THEN ?2 ELSE ?3 END,
                     updated_at = ?4
                 WHERE uniqid = ?5
                 RETURNING attempt_times, desired_state",
                rusqlite::params![
                    i64::from(threshold),
                    ResourceState::Failed.as_str(),
                    ResourceState::Pending.as_str(),
                    now_ts(),
                    uniqid,
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        tx.commit()?;
        histogram!("persist_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        let Some((attempts, desired)) = row else { return Ok(None) };
        counter!("persist_update_total", 1u64);
        let attempts = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
        let desired: ResourceState = desired.parse().with_context(|| format!("decoding resource {}", uniqid))?;
        debug!(uniqid = %uniqid, attempts, "attempt recorded");
        Ok(Some(AttemptRecord::decide(attempts, threshold, desired)))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<FxHashMap<String, ManagedResource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(resource: ManagedResource) -> Self {
        let s = Self::default();
        if let Ok(mut rows) = s.rows.lock() {
            rows.insert(resource.uniqid.clone(), resource);
        }
        s
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FxHashMap<String, ManagedResource>>> {
        self.rows.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

impl ResourceStore for MemoryStore {
    fn get(&self, uniqid: &str) -> Result<Option<ManagedResource>> {
        Ok(self.lock()?.get(uniqid).cloned())
    }

    fn update(&self, uniqid: &str, patch: &ResourcePatch) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(uniqid) {
            Some(r) => {
                patch.apply_to(r);
                counter!("persist_update_total", 1u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put(&self, resource: &ManagedResource) -> Result<()> {
        self.lock()?.insert(resource.uniqid.clone(), resource.clone());
        Ok(())
    }

    fn list_by_state(&self, state: ResourceState) -> Result<Vec<ManagedResource>> {
        let mut out: Vec<ManagedResource> = self.lock()?.values().filter(|r| r.state == state).cloned().collect();
        out.sort_by(|a, b| a.uniqid.cmp(&b.uniqid));
        Ok(out)
    }

    fn record_attempt(&self, uniqid: &str, threshold: u32) -> Result<Option<AttemptRecord>> {
        let mut rows = self.lock()?;
        let Some(r) = rows.get_mut(uniqid) else { return Ok(None) };
        let rec = AttemptRecord::decide(r.attempt_times.saturating_add(1), threshold, r.desired_state);
        r.attempt_times = rec.attempts;
        r.state = rec.state;
        counter!("persist_update_total", 1u64);
        Ok(Some(rec))
    }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceType;

    fn sample(uniqid: &str) -> ManagedResource {
        let mut labels = Labels::new();
        labels.insert("tier".into(), "db".into());
        ManagedResource {
            uniqid: uniqid.into(),
            name: "orders-db".into(),
            appkey: "ak-1".into(),
            channel: "web".into(),
            resource_type: ResourceType::Database,
            desired_state: ResourceState::Started,
            state: ResourceState::Created,
            attempt_times: 0,
            labels,
            message: None,
        }
    }

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn sqlite_put_get_update() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        s.put(&sample("abc123")).unwrap();
        let got = s.get("abc123").unwrap().expect("row");
        assert_eq!(got, sample("abc123"));

        let patch = ResourcePatch { state: Some(ResourceState::Pending), attempt_times: Some(1), message: None };
        assert!(s.update("abc123", &patch).unwrap());
        let got = s.get("abc123").unwrap().unwrap();
        assert_eq!(got.state, ResourceState::Pending);
        assert_eq!(got.attempt_times, 1);
        assert!(got.message.is_none());

        assert!(!s.update("missing", &patch).unwrap());
        assert!(s.get("missing").unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_lists_by_state() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.put(&sample("a")).unwrap();
        let mut b = sample("b");
        b.state = ResourceState::Pending;
        s.put(&b).unwrap();
        let pending = s.list_by_state(ResourceState::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uniqid, "b");
    }

    #[test]
    fn sqlite_normalizes_loose_label_json() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.put(&sample("x")).unwrap();
        s.lock()
            .unwrap()
            .execute("UPDATE managed_resources SET labels = '{\"replicas\": 3}' WHERE uniqid = 'x'", [])
            .unwrap();
        let got = s.get("x").unwrap().unwrap();
        assert_eq!(got.labels.get("replicas").map(String::as_str), Some("3"));
    }

    #[test]
    fn sqlite_record_attempt_increments_in_place() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.put(&sample("abc123")).unwrap();
        let first = s.record_attempt("abc123", 2).unwrap().unwrap();
        assert_eq!(first, AttemptRecord { attempts: 1, state: ResourceState::Pending, desired_state: ResourceState::Started });
        let second = s.record_attempt("abc123", 2).unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.state, ResourceState::Failed);
        let got = s.get("abc123").unwrap().unwrap();
        assert_eq!(got.attempt_times, 2);
        assert_eq!(got.state, ResourceState::Failed);
        assert!(s.record_attempt("missing", 2).unwrap().is_none());
    }

    #[test]
    fn concurrent_attempts_are_all_counted() {
        let path = temp_db();
        let s = Arc::new(SqliteStore::open(&path).unwrap());
        s.put(&sample("abc123")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.record_attempt("abc123", 100).unwrap().unwrap().attempts)
            })
            .collect();
        let mut seen: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
        assert_eq!(s.get("abc123").unwrap().unwrap().attempt_times, 8);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn memory_record_attempt_matches_sqlite() {
        let s = MemoryStore::with(sample("m"));
        assert_eq!(s.record_attempt("m", 1).unwrap().map(|r| r.state), Some(ResourceState::Failed));
        assert_eq!(s.get("m").unwrap().unwrap().attempt_times, 1);
        assert!(s.record_attempt("nope", 1).unwrap().is_none());
    }

    #[test]
    fn memory_store_patch_leaves_unset_fields() {
        let s = MemoryStore::with(sample("m"));
        let patch = ResourcePatch { message: Some("{}".into()), ..Default::default() };
        assert!(s.update("m", &patch).unwrap());
        let got = s.get("m").unwrap().unwrap();
        assert_eq!(got.state, ResourceState::Created);
        assert_eq!(got.message.as_deref(), Some("{}"));
    }
}
