use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::ancestry::AncestryResolver;
use crate::asset::{normalize_value, FeedMessage};
use crate::cache::{document_id, CacheStore};
use crate::config::Config;
use crate::directory::{DirectoryEvent, DirectoryReconciler};
use crate::error::{PipelineError, Result};
use crate::message::{self, Inbound};
use crate::metrics;
use crate::policy::PolicyEvaluator;
use crate::publish::ResultPublisher;
use crate::records::{ComplianceStatus, FunctionConfig, Violation};

/// How far an event got before it finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Normalized,
    Reconciled,
    Resolved,
    Evaluated,
    Published,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Normalized => "normalized",
            Stage::Reconciled => "reconciled",
            Stage::Resolved => "resolved",
            Stage::Evaluated => "evaluated",
            Stage::Published => "published",
        };
        f.write_str(name)
    }
}

/// Terminal state of one delivery; maps onto ack / term / nak.
#[derive(Debug)]
pub enum Outcome {
    Done,
    /// Redelivery cannot help.
    Aborted(PipelineError),
    /// Redeliver the event.
    Failed(PipelineError),
}

impl Outcome {
    fn from_error(err: PipelineError) -> Self {
        if err.is_retryable() {
            Outcome::Failed(err)
        } else {
            Outcome::Aborted(err)
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Aborted(_) => "aborted",
            Outcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub status_subject: String,
    pub violation_subject: String,
    pub max_event_age: Option<Duration>,
    pub cached_asset_types: Vec<String>,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            status_subject: cfg.compliance_status_subject.clone(),
            violation_subject: cfg.violation_subject.clone(),
            max_event_age: cfg.max_event_age(),
            cached_asset_types: cfg.cached_asset_types.clone(),
        }
    }
}

impl From<&Config> for FunctionConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            function_name: cfg.rule.name.clone(),
            project_id: cfg.project_id.clone(),
            environment: cfg.environment.clone(),
            deployment_time: cfg.rule.deployment_time,
        }
    }
}

pub struct Pipeline {
    settings: PipelineSettings,
    function: FunctionConfig,
    cache: Arc<dyn CacheStore>,
    resolver: AncestryResolver,
    evaluator: Arc<dyn PolicyEvaluator>,
    publisher: ResultPublisher,
    directory: DirectoryReconciler,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        function: FunctionConfig,
        cache: Arc<dyn CacheStore>,
        resolver: AncestryResolver,
        evaluator: Arc<dyn PolicyEvaluator>,
        publisher: ResultPublisher,
        directory: DirectoryReconciler,
    ) -> Self {
        Self {
            settings,
            function,
            cache,
            resolver,
            evaluator,
            publisher,
            directory,
        }
    }

    /// Process one inbound payload from scratch. Nothing is kept between
    /// deliveries, so a redelivered event is reprocessed in full.
    pub async fn handle(&self, payload: &[u8]) -> Outcome {
        let outcome = match message::decode(payload) {
            Ok(Inbound::Schedule) => {
                debug!("ignoring schedule tick");
                Outcome::Done
            }
            Ok(Inbound::Feed(doc)) => self.handle_feed(doc).await,
            Ok(Inbound::Directory(event)) => self.handle_directory(&event).await,
            Err(e) => {
                error!("undecodable message stage={}: {e}", Stage::Received);
                Outcome::from_error(e)
            }
        };

        metrics::EVENTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        match &outcome {
            Outcome::Done => {}
            Outcome::Aborted(e) => {
                metrics::EVENT_ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
                metrics::DROPPED_MESSAGES_TOTAL.inc();
            }
            Outcome::Failed(e) => {
                metrics::EVENT_ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
            }
        }
        outcome
    }

    async fn handle_feed(&self, doc: Value) -> Outcome {
        let mut stage = Stage::Received;
        let mut context: Option<String> = None;
        match self.process_feed(doc, &mut stage, &mut context).await {
            Ok(()) => Outcome::Done,
            Err(e) => {
                let context = context.unwrap_or_else(|| "asset=-".to_string());
                if e.is_retryable() {
                    warn!("feed event failed, will retry stage={stage} {context}: {e}");
                } else {
                    error!("feed event dropped stage={stage} {context}: {e}");
                }
                Outcome::from_error(e)
            }
        }
    }

    async fn process_feed(
        &self,
        doc: Value,
        stage: &mut Stage,
        context: &mut Option<String>,
    ) -> Result<()> {
        let mut feed = normalize_value(doc)?;
        *context = Some(feed.log_context());
        *stage = Stage::Normalized;

        self.check_age(&feed)?;

        let violations = if feed.deleted {
            feed = self.reconcile_deleted(feed).await?;
            *stage = Stage::Reconciled;
            Vec::new()
        } else {
            self.resolve(&mut feed).await?;
            *stage = Stage::Resolved;

            let matches = self.evaluator.evaluate(std::slice::from_ref(&feed.asset)).await?;
            *stage = Stage::Evaluated;
            if matches.is_empty() {
                Vec::new()
            } else {
                let rule_source = self.evaluator.rule_source().await?;
                matches
                    .into_iter()
                    .map(|m| Violation::from_match(m, &self.function, &feed, &rule_source))
                    .collect()
            }
        };

        for violation in &violations {
            self.publisher
                .publish_record(&self.settings.violation_subject, violation)
                .await?;
            metrics::VIOLATIONS_PUBLISHED_TOTAL.inc();
        }
        let status = ComplianceStatus::for_feed(&feed, &self.function, violations.is_empty());
        self.publisher
            .publish_record(&self.settings.status_subject, &status)
            .await?;
        *stage = Stage::Published;

        info!(
            "{} compliant={} deleted={} violations={}",
            feed.log_context(),
            status.compliant,
            status.deleted,
            violations.len()
        );
        Ok(())
    }

    fn check_age(&self, feed: &FeedMessage) -> Result<()> {
        let (Some(max_age), Some(start)) = (self.settings.max_event_age, feed.start_time()) else {
            return Ok(());
        };
        match expired_age(start, Utc::now(), max_age) {
            Some(age_secs) => Err(PipelineError::Expired {
                name: feed.asset.name.clone(),
                age_secs,
            }),
            None => Ok(()),
        }
    }

    /// Swap in the last cached observation of the asset, keeping the
    /// deletion's own timing and origin. Without a cache hit the deletion's
    /// asset stands as is.
    async fn reconcile_deleted(&self, feed: FeedMessage) -> Result<FeedMessage> {
        let key = document_id(&feed.asset.name);
        let Some(doc) = self.cache.get(&key).await? else {
            debug!("no cached record for deleted {}", feed.asset.name);
            return Ok(feed);
        };
        match serde_json::from_value::<FeedMessage>(doc) {
            Ok(cached) => Ok(FeedMessage {
                asset: cached.asset,
                ..feed
            }),
            Err(e) => {
                warn!("ignoring undecodable cache record {key}: {e}");
                Ok(feed)
            }
        }
    }

    async fn resolve(&self, feed: &mut FeedMessage) -> Result<()> {
        let resolution = self.resolver.resolve(&feed.asset.ancestors).await;
        resolution.apply(&mut feed.asset);

        if self
            .settings
            .cached_asset_types
            .iter()
            .any(|t| *t == feed.asset.asset_type)
        {
            self.cache
                .put(&document_id(&feed.asset.name), &serde_json::to_value(&*feed)?)
                .await?;
        }
        Ok(())
    }

    async fn handle_directory(&self, event: &DirectoryEvent) -> Outcome {
        let result = match self
            .settings
            .max_event_age
            .and_then(|max_age| expired_age(event.timestamp, Utc::now(), max_age))
        {
            Some(age_secs) => Err(PipelineError::Expired {
                name: format!("directory/{}", event.customer_id),
                age_secs,
            }),
            None => self.directory.handle(event).await,
        };
        match result {
            Ok(published) => {
                debug!(
                    "directory event customer={} published {published} records",
                    event.customer_id
                );
                Outcome::Done
            }
            Err(e) => {
                let ctx = format!(
                    "customer={} origin={} timestamp={}",
                    event.customer_id,
                    event.origin,
                    event.timestamp.to_rfc3339()
                );
                if e.is_retryable() {
                    warn!("directory event failed, will retry {ctx}: {e}");
                } else {
                    error!("directory event dropped {ctx}: {e}");
                }
                Outcome::from_error(e)
            }
        }
    }
}

/// Age in whole seconds when `start` is older than `max_age`. Timestamps in
/// the future are never expired.
fn expired_age(start: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> Option<i64> {
    let age = now.signed_duration_since(start);
    let age_std = age.to_std().ok()?;
    (age_std > max_age).then(|| age.num_seconds())
}
