use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use super::identifier::Key;

pub type Value = Vec<u8>;

/// How long a record may be served before the sweep evicts it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Value,
    stored_at: Instant,
}

/// In-memory key→value map with TTL expiry. Records past their TTL are never
/// served, even if the periodic sweep has not reaped them yet.
#[derive(Debug)]
pub struct Storage {
    map: HashMap<Key, StoredRecord>,
    ttl: Duration,
}

impl Storage {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Storage {
            map: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        self.map.insert(
            key,
            StoredRecord {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        let record = self.map.get(key)?;
        if record.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(&record.value)
    }

    /// Like [`get`](Self::get), but refreshes the record's timestamp: a value
    /// that keeps being asked for keeps living.
    pub fn serve(&mut self, key: &Key) -> Option<Value> {
        let ttl = self.ttl;
        let record = self.map.get_mut(key)?;
        if record.stored_at.elapsed() > ttl {
            return None;
        }
        record.stored_at = Instant::now();
        Some(record.value.clone())
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Drop every expired record; returns how many were evicted.
    pub fn remove_expired(&mut self) -> usize {
        let before = self.map.len();
        let ttl = self.ttl;
        self.map.retain(|_, record| record.stored_at.elapsed() <= ttl);
        before - self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
