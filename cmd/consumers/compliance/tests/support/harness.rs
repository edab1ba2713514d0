use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use compliance::ancestry::{AncestorKind, AncestryResolver};
use compliance::asset::Asset;
use compliance::cache::{CacheStore, MemoryCache};
use compliance::config::FanOutConfig;
use compliance::directory::DirectoryReconciler;
use compliance::hierarchy::{HierarchyApi, HierarchyEntry};
use compliance::policy::{decode_result, PolicyEvaluator, RawMatch};
use compliance::publish::{Publisher, ResultPublisher};
use compliance::records::FunctionConfig;
use compliance::retry::RetryPolicy;
use compliance::{Outcome, Pipeline, PipelineError, PipelineSettings, Result};

pub const STATUS_SUBJECT: &str = "compliance.status";
pub const VIOLATION_SUBJECT: &str = "compliance.violations";
pub const RULE_SOURCE: &str = r#"{"nodes": [], "edges": []}"#;

#[derive(Debug, Clone)]
pub struct Published {
    pub subject: String,
    pub bytes: Vec<u8>,
    pub value: Value,
}

/// Captures every publish. Payloads containing a configured marker are
/// rejected instead.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<Published>>,
    reject_markers: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn reject_payloads_containing(&self, marker: &str) {
        self.reject_markers.lock().unwrap().push(marker.to_string());
    }

    pub fn sent(&self) -> Vec<Published> {
        self.sent.lock().unwrap().clone()
    }

    pub fn on(&self, subject: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|p| p.subject == subject)
            .map(|p| p.value)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let text = String::from_utf8_lossy(&payload).to_string();
        if self
            .reject_markers
            .lock()
            .unwrap()
            .iter()
            .any(|m| text.contains(m.as_str()))
        {
            return Err(PipelineError::Publish {
                subject: subject.to_string(),
                message: "rejected by test publisher".to_string(),
            });
        }
        let value = serde_json::from_slice(&payload).unwrap();
        self.sent.lock().unwrap().push(Published {
            subject: subject.to_string(),
            bytes: payload,
            value,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum EvaluatorFailure {
    MissingRule,
    TransientIo,
}

/// Answers every evaluation with a fixed decision result.
pub struct FakeEvaluator {
    result: Mutex<Value>,
    failure: Mutex<Option<EvaluatorFailure>>,
    evaluated: Mutex<Vec<Asset>>,
}

impl Default for FakeEvaluator {
    fn default() -> Self {
        Self {
            result: Mutex::new(json!({})),
            failure: Mutex::new(None),
            evaluated: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEvaluator {
    pub fn answer(&self, result: Value) {
        *self.result.lock().unwrap() = result;
    }

    pub fn fail_with(&self, failure: EvaluatorFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn evaluated(&self) -> Vec<Asset> {
        self.evaluated.lock().unwrap().clone()
    }
}

#[async_trait(?Send)]
impl PolicyEvaluator for FakeEvaluator {
    async fn evaluate(&self, assets: &[Asset]) -> Result<Vec<RawMatch>> {
        self.evaluated.lock().unwrap().extend_from_slice(assets);
        match *self.failure.lock().unwrap() {
            Some(EvaluatorFailure::MissingRule) => {
                return Err(PipelineError::RuleConfiguration(
                    "decision rule not found".to_string(),
                ))
            }
            Some(EvaluatorFailure::TransientIo) => {
                return Err(PipelineError::Evaluation {
                    message: "resource temporarily unavailable".to_string(),
                    retryable: true,
                })
            }
            None => {}
        }
        let result = self.result.lock().unwrap().clone();
        decode_result(result)
    }

    async fn rule_source(&self) -> Result<String> {
        Ok(RULE_SOURCE.to_string())
    }
}

/// Deterministic hierarchy: `Org <id>`, `Folder <id>`, `Project <id>`.
pub struct StubHierarchy;

#[async_trait]
impl HierarchyApi for StubHierarchy {
    async fn lookup(&self, kind: AncestorKind, id: &str) -> Result<HierarchyEntry> {
        Ok(match kind {
            AncestorKind::Organization => HierarchyEntry {
                display_name: format!("Org {id}"),
                project_id: None,
            },
            AncestorKind::Folder => HierarchyEntry {
                display_name: format!("Folder {id}"),
                project_id: None,
            },
            AncestorKind::Project => HierarchyEntry {
                display_name: format!("Project {id}"),
                project_id: Some(format!("proj-{id}")),
            },
        })
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        status_subject: STATUS_SUBJECT.to_string(),
        violation_subject: VIOLATION_SUBJECT.to_string(),
        max_event_age: None,
        cached_asset_types: vec![
            "cloudresourcemanager.googleapis.com/Organization".to_string(),
            "cloudresourcemanager.googleapis.com/Folder".to_string(),
            "cloudresourcemanager.googleapis.com/Project".to_string(),
        ],
    }
}

pub fn function() -> FunctionConfig {
    FunctionConfig {
        function_name: "instance_owner_label".to_string(),
        project_id: "serviceradar-compliance".to_string(),
        environment: "test".to_string(),
        deployment_time: "2025-01-15T09:30:00Z".parse().unwrap(),
    }
}

/// One decision-result entry for a `RequiredLabel` constraint.
pub fn label_match(msg: &str) -> Value {
    json!({
        "violation": {"msg": msg, "details": {"label": "owner"}},
        "constraint_config": {
            "kind": "RequiredLabel",
            "metadata": {"name": "require-owner"},
            "spec": {
                "severity": "high",
                "match": {"ancestries": ["organization/*"]},
                "parameters": {"label": "owner"}
            }
        }
    })
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub cache: Arc<MemoryCache>,
    pub publisher: Arc<RecordingPublisher>,
    pub evaluator: Arc<FakeEvaluator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        let cache = Arc::new(MemoryCache::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let evaluator = Arc::new(FakeEvaluator::default());

        let store: Arc<dyn CacheStore> = cache.clone();
        let results = ResultPublisher::new(
            publisher.clone(),
            FanOutConfig {
                concurrency: 4,
                progress_every: 10,
            },
        );
        let resolver = AncestryResolver::new(
            store.clone(),
            Arc::new(StubHierarchy),
            RetryPolicy::new(1, Duration::ZERO),
        );
        let directory = DirectoryReconciler::new(store.clone(), results.clone(), "directory");
        let pipeline = Pipeline::new(
            settings,
            function(),
            store,
            resolver,
            evaluator.clone(),
            results,
            directory,
        );

        Self {
            pipeline,
            cache,
            publisher,
            evaluator,
        }
    }

    pub async fn handle(&self, message: &Value) -> Outcome {
        self.pipeline
            .handle(&serde_json::to_vec(message).unwrap())
            .await
    }

    pub async fn seed(&self, name: &str, feed: &Value) {
        self.cache
            .put(&compliance::cache::document_id(name), feed)
            .await
            .unwrap();
    }
}
