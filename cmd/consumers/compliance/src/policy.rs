//! Adapter around the decision engine.
//!
//! The engine sees `{"assets": [...], "constraints": [...]}` and must answer
//! with an object whose `violations` list holds
//! `{"violation": {"msg", "details"}, "constraint_config": {...}}` entries.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use zen_engine::handler::custom_node_adapter::NoopCustomNode;
use zen_engine::loader::LoaderError;
use zen_engine::{DecisionEngine, EvaluationError};

use crate::asset::Asset;
use crate::error::{PipelineError, Result};
use crate::rule_loader::RuleDirLoader;

const CONSTRAINTS_DIR: &str = "constraints";
const DATA_FILE: &str = "data.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub annotations: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub r#match: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub exclude: Value,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintConfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub metadata: ConstraintMetadata,
    pub spec: ConstraintSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViolationDetail {
    pub msg: String,
    #[serde(default)]
    pub details: Value,
}

/// One entry of the engine's result set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawMatch {
    pub violation: ViolationDetail,
    pub constraint_config: ConstraintConfig,
}

/// Decode a decision result into typed matches. A missing or null
/// `violations` field means the assets are compliant.
pub fn decode_result(result: Value) -> Result<Vec<RawMatch>> {
    let Value::Object(mut fields) = result else {
        return Err(PipelineError::MalformedResult(
            "decision result is not an object".to_string(),
        ));
    };
    match fields.remove("violations") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| decode_match(index, item))
            .collect(),
        Some(_) => Err(PipelineError::MalformedResult(
            "violations is not a list".to_string(),
        )),
    }
}

fn decode_match(index: usize, item: Value) -> Result<RawMatch> {
    let Some(fields) = item.as_object() else {
        return Err(PipelineError::MalformedResult(format!(
            "match {index} is not an object"
        )));
    };
    for key in ["violation", "constraint_config"] {
        if !fields.contains_key(key) {
            return Err(PipelineError::MalformedResult(format!(
                "match {index} has no {key}"
            )));
        }
    }
    serde_json::from_value(item)
        .map_err(|e| PipelineError::MalformedResult(format!("match {index}: {e}")))
}

#[async_trait(?Send)]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, assets: &[Asset]) -> Result<Vec<RawMatch>>;

    /// Verbatim text of the rule, attached to violations for audit.
    async fn rule_source(&self) -> Result<String>;
}

type EngineType = DecisionEngine<RuleDirLoader, NoopCustomNode>;

/// Evaluates one zen decision from a rules working directory:
///
/// ```text
/// <dir>/<rule>.json        decision graph
/// <dir>/constraints/*.json constraint definitions
/// <dir>/data.json          asset array of the latest invocation
/// ```
pub struct ZenEvaluator {
    engine: EngineType,
    dir: PathBuf,
    rule_name: String,
}

impl ZenEvaluator {
    pub fn new(dir: impl Into<PathBuf>, rule_name: impl Into<String>) -> Self {
        let dir = dir.into();
        let loader = RuleDirLoader::new(dir.clone());
        Self {
            engine: DecisionEngine::new(
                std::sync::Arc::new(loader),
                std::sync::Arc::new(NoopCustomNode::default()),
            ),
            dir,
            rule_name: rule_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load_constraints(&self) -> Result<Vec<Value>> {
        let dir = self.dir.join(CONSTRAINTS_DIR);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut constraints = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                PipelineError::RuleConfiguration(format!("{}: {e}", path.display()))
            })?;
            serde_json::from_value::<ConstraintConfig>(value.clone()).map_err(|e| {
                PipelineError::RuleConfiguration(format!("{}: {e}", path.display()))
            })?;
            constraints.push(value);
        }
        if constraints.is_empty() {
            return Err(PipelineError::RuleConfiguration(format!(
                "no constraint definitions in {}",
                dir.display()
            )));
        }
        Ok(constraints)
    }
}

/// A missing file will still be missing on redelivery; anything else from
/// the filesystem may be transient.
fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    if e.kind() == ErrorKind::NotFound {
        PipelineError::RuleConfiguration(format!("{} not found", path.display()))
    } else {
        PipelineError::Evaluation {
            message: format!("{}: {e}", path.display()),
            retryable: true,
        }
    }
}

#[async_trait(?Send)]
impl PolicyEvaluator for ZenEvaluator {
    async fn evaluate(&self, assets: &[Asset]) -> Result<Vec<RawMatch>> {
        let constraints = self.load_constraints().await?;

        let assets = serde_json::to_value(assets)?;
        let data_path = self.dir.join(DATA_FILE);
        tokio::fs::write(&data_path, serde_json::to_vec(&assets)?)
            .await
            .map_err(|e| io_error(&data_path, e))?;

        let context = json!({ "assets": assets, "constraints": constraints });
        let resp = match self.engine.evaluate(&self.rule_name, context.into()).await {
            Ok(r) => r,
            Err(e) => {
                if let EvaluationError::LoaderError(le) = e.as_ref() {
                    if let LoaderError::NotFound(key) = le.as_ref() {
                        return Err(PipelineError::RuleConfiguration(format!(
                            "decision {key} not found in {}",
                            self.dir.display()
                        )));
                    }
                }
                return Err(PipelineError::Evaluation {
                    message: e.to_string(),
                    retryable: false,
                });
            }
        };
        debug!("decision {} evaluated", self.rule_name);
        decode_result(Value::from(resp.result))
    }

    async fn rule_source(&self) -> Result<String> {
        let path = self.dir.join(format!("{}.json", self.rule_name));
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }
}
