//! Document store seam. Records are schemaless JSON objects grouped into
//! named collections; the processor only ever appends and reads the newest.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

pub type Record = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Appends `record` to `collection`, returning the new document id.
    async fn add(&self, collection: &str, record: Record) -> Result<String, StoreError>;

    /// Newest-first by the `order_by` field, at most `limit` records.
    async fn query(
        &self,
        collection: &str,
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;
}

/// Records kept per collection when no retention is configured.
pub const DEFAULT_RETENTION: usize = 1_000;

/// In-process store. Each collection keeps only its newest `retention`
/// inserts; older ones are dropped as new records arrive.
#[derive(Debug)]
pub struct MemoryStore {
    retention: usize,
    collections: RwLock<HashMap<String, VecDeque<Record>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, collection: &str, record: Record) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut guard = self.collections.write().await;
        let records = guard.entry(collection.to_string()).or_default();
        records.push_back(record);
        while records.len() > self.retention {
            records.pop_front();
        }
        Ok(id)
    }

    async fn query(
        &self,
        collection: &str,
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let guard = self.collections.read().await;
        let Some(records) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        // Newest insert first so equal keys keep arrival order, newest on top.
        let mut out: Vec<Record> = records.iter().rev().cloned().collect();
        out.sort_by(|a, b| compare_field(b.get(order_by), a.get(order_by)));
        out.truncate(limit);
        Ok(out)
    }
}

/// Orders numbers numerically and strings lexically; missing or mixed values
/// sort below everything else.
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Less,
        (_, Some(Value::Null) | None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
