//! Durable cache tier backed by a SQLite file.
//!
//! Failures degrade rather than propagate: a broken store reads as a miss and
//! write errors are logged and dropped.

use crate::error::GatewayError;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    created_at REAL NOT NULL,
    expires_at REAL NOT NULL,
    namespace TEXT NOT NULL DEFAULT 'default',
    tags TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_namespace ON cache_entries(namespace);
";

/// Tier 1: SQLite-backed key-value store.
pub(crate) struct SqliteTier {
    conn: Mutex<Connection>,
}

impl SqliteTier {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "cannot create cache directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot open cache db {}: {e}", path.display()))
        })?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot initialize cache schema: {e}"))
        })?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Read a key, deleting it when already expired. Errors read as misses.
    pub fn get(&self, key: &str, now_secs: f64) -> Option<Value> {
        let conn = self.lock();
        let row: (Vec<u8>, f64) = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "file cache read failed");
                None
            })?;

        let (blob, expires_at) = row;
        if now_secs > expires_at {
            let _ = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);
            return None;
        }

        match serde_json::from_slice(&blob) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "file cache entry is not valid JSON");
                None
            }
        }
    }

    /// Write a key; returns false (after logging) when the write fails.
    pub fn put(
        &self,
        key: &str,
        value: &Value,
        created_secs: f64,
        expires_secs: f64,
        namespace: &str,
        tags: &HashSet<String>,
    ) -> bool {
        let blob = match serde_json::to_vec(value) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(key, error = %e, "file cache serialization failed");
                return false;
            }
        };
        let result = self.lock().execute(
            "INSERT OR REPLACE INTO cache_entries \
             (key, value, created_at, expires_at, namespace, tags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key, blob, created_secs, expires_secs, namespace, encode_tags(tags)],
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "file cache write failed");
                false
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .map(|n| n > 0)
            .unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "file cache delete failed");
                false
            })
    }

    pub fn delete_prefix(&self, prefix: &str) -> u64 {
        self.lock()
            .execute(
                "DELETE FROM cache_entries WHERE key LIKE ?1 || '%'",
                params![prefix],
            )
            .map(|n| n as u64)
            .unwrap_or_else(|e| {
                tracing::warn!(prefix, error = %e, "file cache prefix delete failed");
                0
            })
    }

    pub fn delete_tag(&self, tag: &str) -> u64 {
        // Tags are stored comma-wrapped so a LIKE matches whole tags only.
        self.lock()
            .execute(
                "DELETE FROM cache_entries WHERE tags LIKE '%,' || ?1 || ',%'",
                params![tag],
            )
            .map(|n| n as u64)
            .unwrap_or_else(|e| {
                tracing::warn!(tag, error = %e, "file cache tag delete failed");
                0
            })
    }

    pub fn sweep(&self, now_secs: f64) -> u64 {
        self.lock()
            .execute("DELETE FROM cache_entries WHERE expires_at < ?1", params![now_secs])
            .map(|n| n as u64)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "file cache sweep failed");
                0
            })
    }

    pub fn clear(&self) {
        if let Err(e) = self.lock().execute("DELETE FROM cache_entries", []) {
            tracing::warn!(error = %e, "file cache clear failed");
        }
    }

    pub fn len(&self) -> u64 {
        self.lock()
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode_tags(tags: &HashSet<String>) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!(",{},", sorted.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tier() -> (SqliteTier, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let tier = SqliteTier::open(&dir.path().join("cache.db")).unwrap();
        (tier, dir)
    }

    fn tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (tier, _dir) = tier();
        assert!(tier.put("k", &json!({"a": 1}), 0.0, 100.0, "default", &HashSet::new()));
        assert_eq!(tier.get("k", 50.0), Some(json!({"a": 1})));
    }

    #[test]
    fn expired_rows_read_as_miss_and_are_deleted() {
        let (tier, _dir) = tier();
        tier.put("k", &json!(1), 0.0, 10.0, "default", &HashSet::new());
        assert_eq!(tier.get("k", 11.0), None);
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn prefix_delete_only_touches_matching_keys() {
        let (tier, _dir) = tier();
        tier.put("prices:sol", &json!(1), 0.0, 100.0, "prices", &HashSet::new());
        tier.put("prices:eth", &json!(2), 0.0, 100.0, "prices", &HashSet::new());
        tier.put("users:1", &json!(3), 0.0, 100.0, "users", &HashSet::new());

        assert_eq!(tier.delete_prefix("prices:"), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.get("users:1", 0.0).is_some());
    }

    #[test]
    fn tag_delete_matches_whole_tags_only() {
        let (tier, _dir) = tier();
        tier.put("a", &json!(1), 0.0, 100.0, "default", &tags(&["sol"]));
        tier.put("b", &json!(2), 0.0, 100.0, "default", &tags(&["solana"]));

        assert_eq!(tier.delete_tag("sol"), 1);
        assert!(tier.get("a", 0.0).is_none());
        assert!(tier.get("b", 0.0).is_some());
    }

    #[test]
    fn sweep_drops_expired_rows() {
        let (tier, _dir) = tier();
        tier.put("old", &json!(1), 0.0, 10.0, "default", &HashSet::new());
        tier.put("fresh", &json!(2), 0.0, 1000.0, "default", &HashSet::new());
        assert_eq!(tier.sweep(500.0), 1);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn survives_reopening_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let tier = SqliteTier::open(&path).unwrap();
            tier.put("k", &json!("persisted"), 0.0, 1e12, "default", &HashSet::new());
        }
        let tier = SqliteTier::open(&path).unwrap();
        assert_eq!(tier.get("k", 1.0), Some(json!("persisted")));
    }
}
