use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::Value;

use crate::ancestry::AncestorKind;
use crate::config::HierarchyApiConfig;
use crate::error::{PipelineError, Result};

/// What the hierarchy API knows about one ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyEntry {
    pub display_name: String,
    /// Human-facing project id, projects only.
    pub project_id: Option<String>,
}

/// Authoritative organization / folder / project lookups, used when the
/// cache has nothing for an ancestor.
#[async_trait]
pub trait HierarchyApi: Send + Sync {
    async fn lookup(&self, kind: AncestorKind, id: &str) -> Result<HierarchyEntry>;
}

/// Cloud Resource Manager REST client.
pub struct ResourceManagerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ResourceManagerClient {
    pub fn new(cfg: &HierarchyApiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let token = cfg
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty());
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, kind: AncestorKind, id: &str) -> String {
        resource_url(&self.base_url, kind, id)
    }
}

fn resource_url(base_url: &str, kind: AncestorKind, id: &str) -> String {
    match kind {
        AncestorKind::Organization => format!("{base_url}/v1/organizations/{id}"),
        AncestorKind::Folder => format!("{base_url}/v2/folders/{id}"),
        AncestorKind::Project => format!("{base_url}/v1/projects/{id}"),
    }
}

fn parse_entry(kind: AncestorKind, body: &Value) -> Result<HierarchyEntry> {
    let field = match kind {
        AncestorKind::Project => "name",
        AncestorKind::Organization | AncestorKind::Folder => "displayName",
    };
    let display_name = body
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::Hierarchy(format!("response has no {field}")))?;
    let project_id = match kind {
        AncestorKind::Project => body
            .get("projectId")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    Ok(HierarchyEntry {
        display_name: display_name.to_string(),
        project_id,
    })
}

#[async_trait]
impl HierarchyApi for ResourceManagerClient {
    async fn lookup(&self, kind: AncestorKind, id: &str) -> Result<HierarchyEntry> {
        let url = self.url(kind, id);
        debug!("hierarchy lookup {url}");
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let body: Value = req
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PipelineError::Hierarchy(e.to_string()))?
            .json()
            .await
            .map_err(|e| PipelineError::Hierarchy(e.to_string()))?;
        parse_entry(kind, &body)
    }
}
