//! Canonical asset model.
//!
//! Upstream feeds deliver assets in two JSON shapes: the current camelCase one
//! (`assetType`, `iamPolicy`, `ancestryPath`) and an older snake_case one
//! (`asset_type`, `iam_policy`, `ancestry_path`). Both decode into [`Asset`].
//! On the way out both spellings are written from the same canonical field so
//! older consumers keep working.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{PipelineError, Result};

pub const DEFAULT_ORIGIN: &str = "real-time";

const LABEL_OWNER: &str = "owner";
const LABEL_VIOLATION_RESOLVER: &str = "violation_resolver";

/// Point-in-time snapshot of a monitored resource or IAM policy binding.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "AssetRepr")]
pub struct Asset {
    pub name: String,
    pub asset_type: String,
    /// Raw ancestor ids, nearest parent first.
    pub ancestors: Vec<String>,
    pub ancestry_path: String,
    pub ancestry_path_display_name: String,
    /// Index-aligned with `ancestors`.
    pub ancestors_display_name: Vec<String>,
    pub owner: Option<String>,
    pub violation_resolver: Option<String>,
    pub project_id: Option<String>,
    pub resource: Option<Value>,
    pub iam_policy: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetRepr {
    #[serde(default)]
    name: String,
    asset_type: Option<String>,
    #[serde(rename = "asset_type")]
    asset_type_legacy: Option<String>,
    #[serde(default)]
    ancestors: Vec<String>,
    ancestry_path: Option<String>,
    #[serde(rename = "ancestry_path")]
    ancestry_path_legacy: Option<String>,
    #[serde(default)]
    ancestry_path_display_name: String,
    #[serde(default)]
    ancestors_display_name: Vec<String>,
    owner: Option<String>,
    violation_resolver: Option<String>,
    project_id: Option<String>,
    resource: Option<Value>,
    iam_policy: Option<Value>,
    #[serde(rename = "iam_policy")]
    iam_policy_legacy: Option<Value>,
}

impl From<AssetRepr> for Asset {
    fn from(raw: AssetRepr) -> Self {
        Asset {
            name: raw.name,
            asset_type: raw
                .asset_type
                .or(raw.asset_type_legacy)
                .unwrap_or_default(),
            ancestors: raw.ancestors,
            ancestry_path: raw
                .ancestry_path
                .or(raw.ancestry_path_legacy)
                .unwrap_or_default(),
            ancestry_path_display_name: raw.ancestry_path_display_name,
            ancestors_display_name: raw.ancestors_display_name,
            owner: raw.owner,
            violation_resolver: raw.violation_resolver,
            project_id: raw.project_id,
            resource: raw.resource,
            iam_policy: raw.iam_policy.or(raw.iam_policy_legacy),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssetOut<'a> {
    name: &'a str,
    asset_type: &'a str,
    #[serde(rename = "asset_type")]
    asset_type_legacy: &'a str,
    ancestors: &'a [String],
    ancestry_path: &'a str,
    #[serde(rename = "ancestry_path")]
    ancestry_path_legacy: &'a str,
    ancestry_path_display_name: &'a str,
    ancestors_display_name: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation_resolver: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iam_policy: Option<&'a Value>,
    #[serde(rename = "iam_policy", skip_serializing_if = "Option::is_none")]
    iam_policy_legacy: Option<&'a Value>,
}

impl Serialize for Asset {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        AssetOut {
            name: &self.name,
            asset_type: &self.asset_type,
            asset_type_legacy: &self.asset_type,
            ancestors: &self.ancestors,
            ancestry_path: &self.ancestry_path,
            ancestry_path_legacy: &self.ancestry_path,
            ancestry_path_display_name: &self.ancestry_path_display_name,
            ancestors_display_name: &self.ancestors_display_name,
            owner: self.owner.as_deref(),
            violation_resolver: self.violation_resolver.as_deref(),
            project_id: self.project_id.as_deref(),
            resource: self.resource.as_ref(),
            iam_policy: self.iam_policy.as_ref(),
            iam_policy_legacy: self.iam_policy.as_ref(),
        }
        .serialize(serializer)
    }
}

impl Asset {
    /// True when neither `resource` nor `iamPolicy` carries any data.
    pub fn has_no_payload(&self) -> bool {
        is_blank(self.resource.as_ref()) && is_blank(self.iam_policy.as_ref())
    }

    /// Resource label lookup. CAI nests labels under `resource.data.labels`;
    /// some producers put them directly under `resource.labels`.
    pub fn label(&self, key: &str) -> Option<String> {
        let resource = self.resource.as_ref()?;
        [
            resource.pointer("/data/labels"),
            resource.pointer("/labels"),
        ]
        .into_iter()
        .flatten()
        .find_map(|labels| labels.get(key).and_then(Value::as_str))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    }

    fn fill_label_fields(&mut self) {
        if let Some(owner) = self.label(LABEL_OWNER) {
            self.owner = Some(owner);
        }
        if let Some(resolver) = self.label(LABEL_VIOLATION_RESOLVER) {
            self.violation_resolver = Some(resolver);
        }
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// When the change was observed upstream.
    #[serde(rename = "startTime", alias = "start_time")]
    pub start_time: DateTime<Utc>,
}

/// One hop in the end-to-end latency trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "stepId", alias = "step_id")]
    pub step_id: String,
    #[serde(rename = "stepTimestamp", alias = "step_timestamp")]
    pub step_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    pub asset: Asset,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
    #[serde(default, alias = "step_stack", skip_serializing_if = "Option::is_none")]
    pub step_stack: Option<Vec<Step>>,
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

impl FeedMessage {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.window.map(|w| w.start_time)
    }

    /// Compact `id@timestamp` rendering of the step stack for log lines.
    pub fn step_trail(&self) -> String {
        match &self.step_stack {
            Some(steps) if !steps.is_empty() => steps
                .iter()
                .map(|s| format!("{}@{}", s.step_id, s.step_timestamp.to_rfc3339()))
                .collect::<Vec<_>>()
                .join(","),
            _ => "-".to_string(),
        }
    }

    /// `asset=.. origin=.. start=.. steps=..` context for log lines.
    pub fn log_context(&self) -> String {
        format!(
            "asset={} origin={} start={} steps={}",
            self.asset.name,
            self.origin,
            self.start_time()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            self.step_trail()
        )
    }
}

/// Decode raw bytes into a canonical [`FeedMessage`].
pub fn normalize(payload: &[u8]) -> Result<FeedMessage> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::MalformedInput(e.to_string()))?;
    normalize_value(value)
}

/// Same as [`normalize`] for an already-parsed document.
pub fn normalize_value(value: Value) -> Result<FeedMessage> {
    let mut msg: FeedMessage = serde_json::from_value(value)
        .map_err(|e| PipelineError::MalformedInput(e.to_string()))?;

    if msg.asset.name.is_empty() {
        return Err(PipelineError::MalformedInput(
            "asset name is missing".to_string(),
        ));
    }
    if msg.origin.is_empty() {
        msg.origin = default_origin();
    }
    // Deletions routinely arrive without a payload and are reconstructed later.
    if !msg.deleted && msg.asset.has_no_payload() {
        return Err(PipelineError::EmptyAsset {
            name: msg.asset.name.clone(),
        });
    }

    msg.asset.fill_label_fields();
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_current_shape() {
        let msg = normalize_value(json!({
            "asset": {
                "name": "//compute.googleapis.com/projects/p1/zones/z/instances/i1",
                "assetType": "compute.googleapis.com/Instance",
                "ancestors": ["projects/1", "organizations/2"],
                "resource": {"data": {"labels": {"owner": "alice", "violation_resolver": "bob"}}}
            },
            "window": {"startTime": "2024-05-01T10:00:00Z"}
        }))
        .unwrap();

        assert_eq!(msg.asset.asset_type, "compute.googleapis.com/Instance");
        assert_eq!(msg.origin, "real-time");
        assert!(!msg.deleted);
        assert_eq!(msg.asset.owner.as_deref(), Some("alice"));
        assert_eq!(msg.asset.violation_resolver.as_deref(), Some("bob"));
        assert_eq!(
            msg.start_time().unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }

    #[test]
    fn decodes_legacy_shape() {
        let msg = normalize_value(json!({
            "asset": {
                "name": "//cloudresourcemanager.googleapis.com/projects/p1",
                "asset_type": "cloudresourcemanager.googleapis.com/Project",
                "ancestry_path": "organization/1/project/2",
                "iam_policy": {"bindings": [{"role": "roles/owner", "members": ["user:a@b.c"]}]}
            },
            "origin": "batch-export",
            "window": {"start_time": "2024-05-01T10:00:00Z"},
            "step_stack": [{"step_id": "convertfeed", "step_timestamp": "2024-05-01T10:00:01Z"}]
        }))
        .unwrap();

        assert_eq!(
            msg.asset.asset_type,
            "cloudresourcemanager.googleapis.com/Project"
        );
        assert_eq!(msg.asset.ancestry_path, "organization/1/project/2");
        assert!(msg.asset.iam_policy.is_some());
        assert_eq!(msg.origin, "batch-export");
        assert_eq!(msg.step_stack.as_ref().unwrap()[0].step_id, "convertfeed");
    }

    #[test]
    fn legacy_mirrors_follow_canonical_fields() {
        let mut msg = normalize_value(json!({
            "asset": {
                "name": "n",
                "assetType": "t",
                "iamPolicy": {"bindings": []},
                "resource": {"data": {}}
            }
        }))
        .unwrap();
        msg.asset.ancestry_path = "organization/1".to_string();
        msg.asset.asset_type = "t2".to_string();

        let out = serde_json::to_value(&msg).unwrap();
        let asset = &out["asset"];
        assert_eq!(asset["assetType"], asset["asset_type"]);
        assert_eq!(asset["asset_type"], "t2");
        assert_eq!(asset["ancestryPath"], asset["ancestry_path"]);
        assert_eq!(asset["iamPolicy"], asset["iam_policy"]);
    }

    #[test]
    fn reads_back_its_own_output() {
        let msg = normalize_value(json!({
            "asset": {"name": "n", "assetType": "t", "resource": {"labels": {"owner": "o"}}},
            "deleted": false
        }))
        .unwrap();
        let bytes = serde_json::to_vec(&msg).unwrap();
        let again = normalize(&bytes).unwrap();
        assert_eq!(msg, again);
    }

    #[test]
    fn empty_live_asset_is_rejected() {
        let err = normalize_value(json!({
            "asset": {"name": "n", "assetType": "t", "resource": {}, "iamPolicy": null}
        }))
        .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyAsset { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_deleted_asset_is_accepted() {
        let msg = normalize_value(json!({
            "asset": {"name": "n", "assetType": "t"},
            "deleted": true
        }))
        .unwrap();
        assert!(msg.deleted);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            normalize(b"not json").unwrap_err(),
            PipelineError::MalformedInput(_)
        ));
        assert!(matches!(
            normalize(br#"{"asset": {"assetType": "t", "resource": {"a": 1}}}"#).unwrap_err(),
            PipelineError::MalformedInput(_)
        ));
        assert!(matches!(
            normalize(br#"{"something": "else"}"#).unwrap_err(),
            PipelineError::MalformedInput(_)
        ));
    }

    #[test]
    fn top_level_labels_are_used() {
        let msg = normalize_value(json!({
            "asset": {"name": "n", "assetType": "t", "resource": {"labels": {"owner": "alice"}}}
        }))
        .unwrap();
        assert_eq!(msg.asset.owner.as_deref(), Some("alice"));
        assert_eq!(msg.asset.violation_resolver, None);
    }
}
