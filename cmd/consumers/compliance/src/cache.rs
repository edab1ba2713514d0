//! Reconciliation cache: the last known FeedMessage for every asset or
//! directory entity whose deletion has to be reconstructed later.

use std::collections::HashMap;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};

/// Document id for an asset name: every `/` becomes `\`.
pub fn document_id(name: &str) -> String {
    name.replace('/', "\\")
}

/// Document filter for [`CacheStore::find`]; must accept documents of any
/// lifetime, including ones decoded inside the backend.
pub type Predicate<'p> = dyn for<'v> Fn(&'v Value) -> bool + Send + Sync + 'p;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Whole-document overwrite.
    async fn put(&self, key: &str, document: &Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Every document the predicate accepts, in no particular order.
    async fn find(&self, predicate: &Predicate<'_>) -> Result<Vec<Value>>;
}

/// Cache backed by a JetStream key/value bucket.
///
/// KV keys only allow `[-/_=.a-zA-Z0-9]`, so document ids are stored under
/// their URL-safe base64 encoding.
#[derive(Clone)]
pub struct KvCache {
    store: kv::Store,
}

pub fn kv_key(document_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(document_id.as_bytes())
}

pub fn document_id_from_kv_key(key: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(key).ok()?;
    String::from_utf8(bytes).ok()
}

impl KvCache {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Open `bucket`, creating it on first use.
    pub async fn open(js: &jetstream::Context, bucket: &str) -> anyhow::Result<Self> {
        let store = match js.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => {
                info!("creating cache bucket {bucket}");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await?
            }
        };
        Ok(Self::new(store))
    }
}

#[async_trait]
impl CacheStore for KvCache {
    async fn put(&self, key: &str, document: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        self.store
            .put(kv_key(key), bytes.into())
            .await
            .map_err(|e| PipelineError::Cache(e.to_string()))?;
        debug!("cached document {key}");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self
            .store
            .get(kv_key(key))
            .await
            .map_err(|e| PipelineError::Cache(e.to_string()))?
        {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(doc) => Ok(Some(doc)),
                Err(e) => {
                    warn!("cached document {key} is not valid JSON, ignoring: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn find(&self, predicate: &Predicate<'_>) -> Result<Vec<Value>> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| PipelineError::Cache(e.to_string()))?;
        let mut matches = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| PipelineError::Cache(e.to_string()))?;
            let Some(bytes) = self
                .store
                .get(&key)
                .await
                .map_err(|e| PipelineError::Cache(e.to_string()))?
            else {
                continue;
            };
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(doc) if predicate(&doc) => matches.push(doc),
                Ok(_) => {}
                Err(e) => warn!("skipping undecodable cache entry {key}: {e}"),
            }
        }
        Ok(matches)
    }
}

/// In-process cache, used for local runs and tests.
#[derive(Default)]
pub struct MemoryCache {
    docs: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn put(&self, key: &str, document: &Value) -> Result<()> {
        self.docs
            .write()
            .await
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn find(&self, predicate: &Predicate<'_>) -> Result<Vec<Value>> {
        Ok(self
            .docs
            .read()
            .await
            .values()
            .filter(|doc| predicate(doc))
            .cloned()
            .collect())
    }
}
