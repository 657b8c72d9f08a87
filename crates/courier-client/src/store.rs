use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::Value;

/// Durable client-side key/value storage. Keys are slash-separated strings
/// ("outbox/<temp-id>"), values are JSON. Implementations must survive
/// process restarts except for [`MemoryStore`].
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// One JSON file per key under a directory. Writes go through a temp file +
/// rename so a crash mid-write never leaves a truncated value behind.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("parsing stored value at {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(value)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("committing {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(encoded) = name.strip_suffix(".json") else { continue };
            let Some(key) = decode_key(encoded) else { continue };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.values
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.locked()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.locked()?.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.locked()?.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .locked()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Keys may contain path separators; encode anything outside a conservative
/// filename alphabet as %XX.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> FileStore {
        let dir = std::env::temp_dir()
            .join("courier-store-test")
            .join(uuid::Uuid::new_v4().to_string());
        FileStore::open(dir).unwrap()
    }

    #[test]
    fn file_store_roundtrip() {
        let store = temp_store();
        let value = json!({"room_id": "r1", "body": "hello"});

        store.put("outbox/abc123", &value).unwrap();
        assert_eq!(store.get("outbox/abc123").unwrap(), Some(value));

        store.remove("outbox/abc123").unwrap();
        assert_eq!(store.get("outbox/abc123").unwrap(), None);
        // Removing a missing key is fine.
        store.remove("outbox/abc123").unwrap();
    }

    #[test]
    fn file_store_prefix_listing() {
        let store = temp_store();
        store.put("outbox/b", &json!(2)).unwrap();
        store.put("outbox/a", &json!(1)).unwrap();
        store.put("rejoin/r", &json!(true)).unwrap();

        assert_eq!(store.keys("outbox/").unwrap(), vec!["outbox/a", "outbox/b"]);
        assert_eq!(store.keys("rejoin/").unwrap(), vec!["rejoin/r"]);
    }

    #[test]
    fn overwrite_replaces_value() {
        let store = temp_store();
        store.put("k", &json!(1)).unwrap();
        store.put("k", &json!(2)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn key_encoding_roundtrip() {
        for key in ["outbox/abc", "a b/c%d", "plain", "ключ"] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("outbox/x", &json!("v")).unwrap();
        assert_eq!(store.get("outbox/x").unwrap(), Some(json!("v")));
        assert_eq!(store.keys("outbox/").unwrap(), vec!["outbox/x"]);
        store.remove("outbox/x").unwrap();
        assert!(store.keys("outbox/").unwrap().is_empty());
    }
}
