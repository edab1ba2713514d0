use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

/// The rule this consumer instance evaluates.
#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    /// Working directory holding `<name>.json` and `constraints/`.
    pub dir: PathBuf,
    pub deployment_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AncestryConfig {
    #[serde(default = "default_cache_attempts")]
    pub cache_attempts: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

impl Default for AncestryConfig {
    fn default() -> Self {
        Self {
            cache_attempts: default_cache_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
        }
    }
}

impl AncestryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.cache_attempts,
            Duration::from_millis(self.backoff_step_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HierarchyApiConfig {
    #[serde(default = "default_hierarchy_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_hierarchy_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HierarchyApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_hierarchy_base_url(),
            token_env: None,
            timeout_secs: default_hierarchy_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FanOutConfig {
    #[serde(default = "default_fanout_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            concurrency: default_fanout_concurrency(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_prefix")]
    pub subject_prefix: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_directory_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub nats_url: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub stream_name: String,
    pub consumer_name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default = "default_status_subject")]
    pub compliance_status_subject: String,
    #[serde(default = "default_violation_subject")]
    pub violation_subject: String,
    #[serde(default = "default_kv_bucket")]
    pub kv_bucket: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// Events observed longer ago than this are dropped; 0 disables the check.
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Asset types whose live observations are written to the cache.
    #[serde(default = "default_cached_asset_types")]
    pub cached_asset_types: Vec<String>,
    pub rule: RuleConfig,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub ancestry: AncestryConfig,
    #[serde(default)]
    pub hierarchy_api: HierarchyApiConfig,
    #[serde(default)]
    pub fanout: FanOutConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub security: Option<SecurityConfig>,
}

fn default_status_subject() -> String {
    "compliance.status".to_string()
}

fn default_violation_subject() -> String {
    "compliance.violations".to_string()
}

fn default_kv_bucket() -> String {
    "serviceradar-compliance-assets".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:50056".to_string()
}

const fn default_max_event_age_secs() -> u64 {
    600
}

const fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_cached_asset_types() -> Vec<String> {
    vec![
        "cloudresourcemanager.googleapis.com/Organization".to_string(),
        "cloudresourcemanager.googleapis.com/Folder".to_string(),
        "cloudresourcemanager.googleapis.com/Project".to_string(),
    ]
}

const fn default_cache_attempts() -> u32 {
    10
}

const fn default_backoff_step_ms() -> u64 {
    100
}

fn default_hierarchy_base_url() -> String {
    "https://cloudresourcemanager.googleapis.com".to_string()
}

const fn default_hierarchy_timeout_secs() -> u64 {
    10
}

const fn default_fanout_concurrency() -> usize {
    32
}

const fn default_progress_every() -> usize {
    100
}

fn default_directory_prefix() -> String {
    "directory".to_string()
}

impl Config {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let cfg: Config = serde_json::from_str(&content).context("Failed to parse config file")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nats_url.is_empty() {
            anyhow::bail!("nats_url is required");
        }
        if self.stream_name.is_empty() {
            anyhow::bail!("stream_name is required");
        }
        if self.consumer_name.is_empty() {
            anyhow::bail!("consumer_name is required");
        }
        if self.subjects.is_empty() {
            anyhow::bail!("at least one subject is required");
        }
        if self.compliance_status_subject.is_empty() || self.violation_subject.is_empty() {
            anyhow::bail!("compliance_status_subject and violation_subject are required");
        }
        if self.kv_bucket.is_empty() {
            anyhow::bail!("kv_bucket is required");
        }
        if self.rule.name.is_empty() {
            anyhow::bail!("rule.name is required");
        }
        if self.rule.dir.as_os_str().is_empty() {
            anyhow::bail!("rule.dir is required");
        }
        if self.fanout.concurrency == 0 {
            anyhow::bail!("fanout.concurrency must be at least 1");
        }
        if self.directory.subject_prefix.is_empty() {
            anyhow::bail!("directory.subject_prefix is required");
        }
        if let Some(subject) = self
            .subjects
            .iter()
            .find(|s| subject_overlaps_prefix(s, &self.directory.subject_prefix))
        {
            anyhow::bail!(
                "subject {subject} would consume the consumer's own {}.> output",
                self.directory.subject_prefix
            );
        }
        Ok(())
    }

    pub fn max_event_age(&self) -> Option<Duration> {
        (self.max_event_age_secs > 0).then(|| Duration::from_secs(self.max_event_age_secs))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Whether a filter subject can match any subject under `<prefix>.>`.
fn subject_overlaps_prefix(subject: &str, prefix: &str) -> bool {
    let tokens: Vec<&str> = subject.split('.').collect();
    let prefix_tokens: Vec<&str> = prefix.split('.').collect();
    for (i, expected) in prefix_tokens.iter().enumerate() {
        match tokens.get(i) {
            Some(&">") => return true,
            Some(&"*") => {}
            Some(token) if token == expected => {}
            _ => return false,
        }
    }
    tokens.len() > prefix_tokens.len()
}
