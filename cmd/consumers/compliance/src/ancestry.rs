//! Ancestor display-name resolution.
//!
//! Display names are best-effort enrichment: a lookup that fails degrades that
//! one entry to [`UNKNOWN`], it never fails the event.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use crate::asset::Asset;
use crate::cache::{document_id, CacheStore};
use crate::hierarchy::{HierarchyApi, HierarchyEntry};
use crate::metrics;
use crate::retry::RetryPolicy;

pub const UNKNOWN: &str = "unknown";

const RESOURCE_MANAGER_PREFIX: &str = "//cloudresourcemanager.googleapis.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AncestorKind {
    Organization,
    Folder,
    Project,
}

impl AncestorKind {
    /// Split `folders/123` into its kind and id. Anything outside the
    /// resource hierarchy (directory customers, groups) yields `None`.
    pub fn parse(raw: &str) -> Option<(AncestorKind, &str)> {
        let (kind, id) = raw.split_once('/')?;
        let kind = match kind {
            "organizations" => AncestorKind::Organization,
            "folders" => AncestorKind::Folder,
            "projects" => AncestorKind::Project,
            _ => return None,
        };
        if id.is_empty() {
            return None;
        }
        Some((kind, id))
    }
}

/// Root-first, slash-joined ancestry path with singular type tokens, the
/// form policy match expressions are written against.
pub fn build_path(ids: &[String]) -> String {
    ids.iter()
        .rev()
        .map(|id| singularize(id))
        .collect::<Vec<_>>()
        .join("/")
}

fn singularize(id: &str) -> String {
    for (plural, singular) in [
        ("organizations/", "organization/"),
        ("folders/", "folder/"),
        ("projects/", "project/"),
    ] {
        if let Some(rest) = id.strip_prefix(plural) {
            return format!("{singular}{rest}");
        }
    }
    id.to_string()
}

/// Display names for one asset's ancestors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Index-aligned with the input ancestors.
    pub display_names: Vec<String>,
    pub project_id: Option<String>,
}

impl Resolution {
    /// Fill the derived ancestry fields of `asset`.
    pub fn apply(self, asset: &mut Asset) {
        asset.ancestry_path = build_path(&asset.ancestors);
        asset.ancestry_path_display_name = self
            .display_names
            .iter()
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/");
        asset.ancestors_display_name = self.display_names;
        if asset.project_id.is_none() {
            asset.project_id = self.project_id;
        }
    }
}

pub struct AncestryResolver {
    cache: Arc<dyn CacheStore>,
    api: Arc<dyn HierarchyApi>,
    retry: RetryPolicy,
}

impl AncestryResolver {
    pub fn new(cache: Arc<dyn CacheStore>, api: Arc<dyn HierarchyApi>, retry: RetryPolicy) -> Self {
        Self { cache, api, retry }
    }

    pub async fn resolve(&self, ancestors: &[String]) -> Resolution {
        let mut resolution = Resolution {
            display_names: Vec::with_capacity(ancestors.len()),
            project_id: None,
        };
        for raw in ancestors {
            let Some((kind, id)) = AncestorKind::parse(raw) else {
                resolution.display_names.push(raw.clone());
                continue;
            };
            match self.lookup(kind, id, raw).await {
                Some(entry) => {
                    if kind == AncestorKind::Project && resolution.project_id.is_none() {
                        resolution.project_id = entry.project_id;
                    }
                    resolution.display_names.push(entry.display_name);
                }
                None => {
                    metrics::ANCESTRY_UNKNOWN_TOTAL.inc();
                    resolution.display_names.push(UNKNOWN.to_string());
                }
            }
        }
        resolution
    }

    async fn lookup(&self, kind: AncestorKind, id: &str, raw: &str) -> Option<HierarchyEntry> {
        let doc_id = document_id(&format!("{RESOURCE_MANAGER_PREFIX}{raw}"));
        let key = doc_id.as_str();
        let cache = &self.cache;
        let cached = self
            .retry
            .run(raw, |attempt| async move {
                match cache.get(key).await {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!("cache read for {raw} failed on attempt {attempt}: {e}");
                        None
                    }
                }
            })
            .await;

        if let Some(entry) = cached.as_ref().and_then(|doc| entry_from_cached(kind, doc)) {
            debug!("resolved {raw} from cache");
            return Some(entry);
        }

        match self.api.lookup(kind, id).await {
            Ok(entry) => {
                debug!("resolved {raw} from hierarchy API");
                Some(entry)
            }
            Err(e) => {
                warn!("could not resolve display name for {raw}, using {UNKNOWN}: {e}");
                None
            }
        }
    }
}

/// Read the display name out of a cached FeedMessage for a hierarchy asset.
fn entry_from_cached(kind: AncestorKind, doc: &Value) -> Option<HierarchyEntry> {
    let data = doc.pointer("/asset/resource/data")?;
    let field = match kind {
        AncestorKind::Project => "name",
        AncestorKind::Organization | AncestorKind::Folder => "displayName",
    };
    let display_name = data.get(field)?.as_str().filter(|s| !s.is_empty())?;
    let project_id = match kind {
        AncestorKind::Project => data
            .get("projectId")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    Some(HierarchyEntry {
        display_name: display_name.to_string(),
        project_id,
    })
}
