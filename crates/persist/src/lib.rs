//! Keel persistence: SQLite journal that keeps KV buckets across restarts.
//! Small and synchronous; writes happen under the bucket lock.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use keel_kv::{Entry, Journal, Operation};
use metrics::{counter, histogram};
use tracing::debug;

/// Rows kept per key; only the newest is restored.
fn default_path() -> String {
    std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path())
}

fn history_depth() -> i64 {
    std::env::var("KEEL_JOURNAL_HISTORY").ok().and_then(|s| s.parse::<i64>().ok()).unwrap_or(3).max(1)
}

pub struct SqliteJournal {
    db: std::sync::Mutex<rusqlite::Connection>,
    history: i64,
}

impl SqliteJournal {
    /// Exclusive open of `KEEL_DB_PATH`, or `~/.keel/keel.db`.
    pub fn open_default() -> Result<Self> {
        Self::open_exclusive(&default_path())
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, false)
    }

    /// Open and hold the database for this connection alone until it is dropped. Other
    /// processes opening the same file fail instead of writing behind its back.
    pub fn open_exclusive(path: &str) -> Result<Self> {
        Self::open_with(path, true)
    }

    fn open_with(path: &str, exclusive: bool) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.busy_timeout(std::time::Duration::from_millis(500)).ok();
        if exclusive {
            let mode: String = db
                .pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))
                .context("setting exclusive locking")?;
            debug!(path, mode = %mode, "journal locking mode");
        }
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                bucket   TEXT NOT NULL,
                key      TEXT NOT NULL,
                revision INTEGER NOT NULL,
                op       TEXT NOT NULL,
                created  INTEGER NOT NULL,
                value    BLOB NOT NULL
            )",
            [],
        )
        .context("creating kv_entries table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_entries_key_rev ON kv_entries(bucket, key, revision DESC)",
            [],
        )
        .ok();
        if exclusive {
            // The first write takes the file lock, and exclusive mode never releases it.
            db.execute_batch(
                "CREATE TABLE IF NOT EXISTS journal_owner (id INTEGER PRIMARY KEY, pid INTEGER NOT NULL, since INTEGER NOT NULL)",
            )
            .context("creating journal_owner table")?;
            db.execute(
                "INSERT OR REPLACE INTO journal_owner (id, pid, since) VALUES (1, ?1, ?2)",
                rusqlite::params![std::process::id() as i64, Utc::now().timestamp_millis()],
            )
            .with_context(|| format!("{} is in use by another process", path))?;
        }
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, exclusive, "journal opened");
        Ok(Self { db: std::sync::Mutex::new(db), history: history_depth() })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("journal connection poisoned"))
    }
}

impl Journal for SqliteJournal {
    fn load(&self, bucket: &str) -> Result<Vec<Entry>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT key, revision, op, created, value FROM kv_entries e
             WHERE bucket = ?1
               AND revision = (SELECT MAX(revision) FROM kv_entries WHERE bucket = e.bucket AND key = e.key)
             ORDER BY revision",
        )?;
        let mut rows = stmt.query([bucket])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let revision: i64 = row.get(1)?;
            let op: String = row.get(2)?;
            let created_ms: i64 = row.get(3)?;
            let value: Vec<u8> = row.get(4)?;
            let operation = Operation::parse(&op).ok_or_else(|| anyhow!("unknown operation {:?} for {}", op, key))?;
            let created = Utc.timestamp_millis_opt(created_ms).single().unwrap_or_else(Utc::now);
            out.push(Entry { key, value, revision: revision as u64, operation, created });
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn append(&self, bucket: &str, entry: &Entry) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO kv_entries(bucket, key, revision, op, created, value) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                bucket,
                &entry.key,
                entry.revision as i64,
                entry.operation.as_str(),
                entry.created.timestamp_millis(),
                &entry.value,
            ),
        )?;
        // Keep the newest `history` rows per key
        tx.execute(
            "DELETE FROM kv_entries
             WHERE bucket = ?1 AND key = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM kv_entries WHERE bucket = ?1 AND key = ?2 ORDER BY revision DESC LIMIT ?3
               )",
            (bucket, &entry.key, self.history),
        )?;
        tx.commit()?;
        histogram!("persist_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_append_total", 1u64);
        Ok(())
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM kv_entries WHERE bucket = ?1 AND key = ?2", (bucket, key))?;
        counter!("persist_remove_total", 1u64);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keel_kv::{BucketConfig, KeyValue, MemoryKv};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn entry(key: &str, rev: u64, op: Operation) -> Entry {
        Entry { key: key.into(), value: format!("v{}", rev).into_bytes(), revision: rev, operation: op, created: Utc::now() }
    }

    #[test]
    fn append_rotates_and_load_returns_latest() {
        let j = SqliteJournal::open(&temp_db()).unwrap();
        for rev in 1..=5 {
            j.append("b", &entry("w.t.a", rev, Operation::Put)).unwrap();
        }
        j.append("b", &entry("w.t.b", 6, Operation::Delete)).unwrap();
        j.append("other", &entry("w.t.a", 7, Operation::Put)).unwrap();

        let rows = j.load("b").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].key.as_str(), rows[0].revision, rows[0].value.as_slice()), ("w.t.a", 5, b"v5".as_slice()));
        assert_eq!(rows[1].operation, Operation::Delete);

        let db = j.conn().unwrap();
        let kept: i64 = db
            .query_row("SELECT COUNT(*) FROM kv_entries WHERE bucket = 'b' AND key = 'w.t.a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kept, j.history);
    }

    #[test]
    fn remove_drops_every_row_for_key() {
        let j = SqliteJournal::open(&temp_db()).unwrap();
        j.append("b", &entry("w.t.a", 1, Operation::Put)).unwrap();
        j.remove("b", "w.t.a").unwrap();
        assert!(j.load("b").unwrap().is_empty());
    }

    #[tokio::test]
    async fn bucket_survives_reopen() {
        let path = temp_db();
        {
            let kv = MemoryKv::with_journal(BucketConfig::new("objects"), Arc::new(SqliteJournal::open(&path).unwrap())).unwrap();
            kv.create("w.t.a", b"1".to_vec()).await.unwrap();
            kv.create("w.t.b", b"1".to_vec()).await.unwrap();
            kv.purge("w.t.b").await.unwrap();
        }
        let kv = MemoryKv::with_journal(BucketConfig::new("objects"), Arc::new(SqliteJournal::open(&path).unwrap())).unwrap();
        let e = kv.get("w.t.a").await.unwrap();
        assert_eq!(e.revision, 1);
        assert!(kv.get("w.t.b").await.is_err());
        // revisions continue after the restored maximum
        assert_eq!(kv.put("w.t.c", vec![]).await.unwrap(), 2);
    }

    #[test]
    fn exclusive_journal_locks_out_other_openers() {
        let path = temp_db();
        let owner = SqliteJournal::open_exclusive(&path).unwrap();
        owner.append("b", &entry("w.t.a", 1, Operation::Put)).unwrap();
        assert!(SqliteJournal::open(&path).is_err());
        drop(owner);
        let j = SqliteJournal::open(&path).unwrap();
        assert_eq!(j.load("b").unwrap().len(), 1);
    }
}
