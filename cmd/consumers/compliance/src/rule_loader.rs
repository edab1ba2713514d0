use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zen_engine::loader::{DecisionLoader, LoaderError, LoaderResponse};
use zen_engine::model::DecisionContent;

/// Loads `<root>/<key>.json` decisions, re-reading the file on every load so
/// an updated rule takes effect on the next event.
#[derive(Debug, Clone)]
pub struct RuleDirLoader {
    root: PathBuf,
}

impl RuleDirLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn decision_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    async fn load_from_dir(&self, key: &str) -> LoaderResponse {
        match tokio::fs::read(self.decision_path(key)).await {
            Ok(bytes) => {
                let content: DecisionContent =
                    serde_json::from_slice(&bytes).map_err(|e| LoaderError::Internal {
                        key: key.to_string(),
                        source: e.into(),
                    })?;
                Ok(Arc::new(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LoaderError::NotFound(key.to_string()).into())
            }
            Err(e) => Err(LoaderError::Internal {
                key: key.to_string(),
                source: e.into(),
            }
            .into()),
        }
    }
}

impl DecisionLoader for RuleDirLoader {
    async fn load<'a>(&'a self, key: &'a str) -> LoaderResponse {
        self.load_from_dir(key).await
    }
}
