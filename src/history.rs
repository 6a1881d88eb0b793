//! HistoryStore: an append-only message sequence scoped to a
//! `SessionIdentity`, backed by a chain of pluggable persistence drivers.
//!
//! A session's history is independent of which provider is currently
//! active for a given turn, so switching providers mid-fallback never
//! loses or forks history.

use crate::message::Message;
use crate::session::SessionIdentity;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock as StdRwLock;
use tokio::sync::RwLock;

/// A persistence driver's contract: read the raw record for an identity,
/// write it back. "Empty" (no record yet) and "error" (driver failure) are
/// kept distinct — a driver returns `Ok(None)` for the former and `Err`
/// only for an actual failure.
#[async_trait]
pub trait HistoryDriver: Send + Sync {
    async fn read(&self, identity: &SessionIdentity) -> Result<Option<Value>, String>;
    async fn write(&self, identity: &SessionIdentity, record: Value) -> Result<(), String>;
    async fn clear(&self, identity: &SessionIdentity) -> Result<(), String>;
}

/// In-memory driver; the default when no persistence is configured.
#[derive(Default)]
pub struct InMemoryDriver {
    records: StdRwLock<HashMap<String, Value>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryDriver for InMemoryDriver {
    async fn read(&self, identity: &SessionIdentity) -> Result<Option<Value>, String> {
        Ok(self.records.read().unwrap().get(&identity.key()).cloned())
    }

    async fn write(&self, identity: &SessionIdentity, record: Value) -> Result<(), String> {
        self.records.write().unwrap().insert(identity.key(), record);
        Ok(())
    }

    async fn clear(&self, identity: &SessionIdentity) -> Result<(), String> {
        self.records.write().unwrap().remove(&identity.key());
        Ok(())
    }
}

/// File-backed driver: one JSON file per session key under a root directory.
pub struct FileDriver {
    root: PathBuf,
}

impl FileDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, identity: &SessionIdentity) -> PathBuf {
        let safe_key = identity.key().replace([':', '/'], "_");
        self.root.join(format!("{safe_key}.json"))
    }
}

#[async_trait]
impl HistoryDriver for FileDriver {
    async fn read(&self, identity: &SessionIdentity) -> Result<Option<Value>, String> {
        let path = self.path_for(identity);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| e.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn write(&self, identity: &SessionIdentity, record: Value) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| e.to_string())?;
        let path = self.path_for(identity);
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| e.to_string())?;
        tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string())
    }

    async fn clear(&self, identity: &SessionIdentity) -> Result<(), String> {
        let path = self.path_for(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// The store: an in-process cache of loaded sequences plus a chain of
/// drivers (primary first, then replicas). A read returns the first
/// non-empty, non-erroring response; writes fan out to every driver,
/// best-effort (one driver's error never prevents the others from being
/// written).
pub struct HistoryStore {
    drivers: Vec<Box<dyn HistoryDriver>>,
    cache: RwLock<HashMap<String, Vec<Message>>>,
}

impl HistoryStore {
    pub fn new(drivers: Vec<Box<dyn HistoryDriver>>) -> Self {
        Self {
            drivers,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(vec![Box::new(InMemoryDriver::new())])
    }

    pub async fn load(&self, identity: &SessionIdentity) -> Result<Vec<Message>, String> {
        if let Some(cached) = self.cache.read().await.get(&identity.key()) {
            return Ok(cached.clone());
        }

        for driver in &self.drivers {
            match driver.read(identity).await {
                Ok(Some(record)) => {
                    let messages = decode_record(&record)?;
                    self.cache
                        .write()
                        .await
                        .insert(identity.key(), messages.clone());
                    return Ok(messages);
                }
                Ok(None) => continue,
                Err(_) => continue,
            }
        }
        Ok(Vec::new())
    }

    pub async fn append(&self, identity: &SessionIdentity, msg: Message) -> Result<(), String> {
        let mut messages = self.load(identity).await?;
        messages.push(msg);
        self.cache
            .write()
            .await
            .insert(identity.key(), messages.clone());
        self.fan_out_write(identity, &messages).await;
        Ok(())
    }

    pub async fn save(&self, identity: &SessionIdentity) -> Result<(), String> {
        let messages = self.load(identity).await?;
        self.fan_out_write(identity, &messages).await;
        Ok(())
    }

    /// Atomically replace the sequence, used by the TruncationEngine.
    pub async fn replace(&self, identity: &SessionIdentity, messages: Vec<Message>) -> Result<(), String> {
        self.cache
            .write()
            .await
            .insert(identity.key(), messages.clone());
        self.fan_out_write(identity, &messages).await;
        Ok(())
    }

    pub async fn clear(&self, identity: &SessionIdentity) -> Result<(), String> {
        self.cache.write().await.remove(&identity.key());
        for driver in &self.drivers {
            let _ = driver.clear(identity).await;
        }
        Ok(())
    }

    pub async fn last(&self, identity: &SessionIdentity) -> Result<Option<Message>, String> {
        Ok(self.load(identity).await?.into_iter().last())
    }

    async fn fan_out_write(&self, identity: &SessionIdentity, messages: &[Message]) {
        let record = encode_record(messages);
        for driver in &self.drivers {
            if let Err(e) = driver.write(identity, record.clone()).await {
                log::warn!("history driver write failed for {}: {e}", identity.key());
            }
        }
    }
}

fn encode_record(messages: &[Message]) -> Value {
    Value::Array(messages.iter().map(Message::to_wire).collect())
}

fn decode_record(record: &Value) -> Result<Vec<Message>, String> {
    let arr = record.as_array().ok_or("history record is not an array")?;
    arr.iter()
        .map(|v| Message::from_wire(v).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_is_visible_to_subsequent_load() {
        let store = HistoryStore::in_memory();
        let identity = SessionIdentity::new("bot");
        store.append(&identity, Message::user("hi")).await.unwrap();
        store
            .append(&identity, Message::assistant("hello", None))
            .await
            .unwrap();
        let loaded = store.load(&identity).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn different_identities_are_independent() {
        let store = HistoryStore::in_memory();
        let a = SessionIdentity::new("bot").with_user_id("alice");
        let b = SessionIdentity::new("bot").with_user_id("bob");
        store.append(&a, Message::user("hi from alice")).await.unwrap();
        assert_eq!(store.load(&a).await.unwrap().len(), 1);
        assert_eq!(store.load(&b).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn file_driver_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(vec![Box::new(FileDriver::new(dir.path()))]);
        let identity = SessionIdentity::new("bot");
        store.append(&identity, Message::tool_result("id1", "get_weather", "w")).await.unwrap();

        // Fresh store, same directory: simulates a process restart.
        let reloaded = HistoryStore::new(vec![Box::new(FileDriver::new(dir.path()))]);
        let messages = reloaded.load(&identity).await.unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::ToolResult { tool_name, .. } => assert_eq!(tool_name, "get_weather"),
            _ => panic!("expected ToolResult"),
        }
    }

    #[tokio::test]
    async fn failing_primary_driver_does_not_block_replica_write() {
        struct AlwaysFails;
        #[async_trait]
        impl HistoryDriver for AlwaysFails {
            async fn read(&self, _: &SessionIdentity) -> Result<Option<Value>, String> {
                Err("down".into())
            }
            async fn write(&self, _: &SessionIdentity, _: Value) -> Result<(), String> {
                Err("down".into())
            }
            async fn clear(&self, _: &SessionIdentity) -> Result<(), String> {
                Err("down".into())
            }
        }

        let replica = Box::new(InMemoryDriver::new());
        let store = HistoryStore::new(vec![Box::new(AlwaysFails), replica]);
        let identity = SessionIdentity::new("bot");
        store.append(&identity, Message::user("hi")).await.unwrap();
        // cache still has it even though the primary driver is broken
        assert_eq!(store.load(&identity).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_is_atomic_for_truncation() {
        let store = HistoryStore::in_memory();
        let identity = SessionIdentity::new("bot");
        store.append(&identity, Message::system("s")).await.unwrap();
        store.append(&identity, Message::user("u1")).await.unwrap();
        store.append(&identity, Message::user("u2")).await.unwrap();

        store
            .replace(&identity, vec![Message::system("s"), Message::user("u2")])
            .await
            .unwrap();
        assert_eq!(store.load(&identity).await.unwrap().len(), 2);
    }
}
