use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, stream::StorageType};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::FanOutConfig;
use crate::error::{PipelineError, Result};
use crate::metrics;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;
}

/// A stream created on first publish to any subject under `prefix`.
#[derive(Debug, Clone)]
struct AutoStream {
    name: String,
    prefix: String,
}

impl AutoStream {
    fn covers(&self, subject: &str) -> bool {
        subject
            .strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

pub struct JetStreamPublisher {
    js: jetstream::Context,
    ack_timeout: Duration,
    auto_streams: Vec<AutoStream>,
    ready: Mutex<HashSet<String>>,
}

impl JetStreamPublisher {
    pub fn new(js: jetstream::Context, ack_timeout: Duration) -> Self {
        Self {
            js,
            ack_timeout,
            auto_streams: Vec::new(),
            ready: Mutex::new(HashSet::new()),
        }
    }

    /// Ensure a stream named `name` capturing `prefix.>` exists before the
    /// first publish to one of its subjects.
    pub fn with_auto_stream(mut self, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.auto_streams.push(AutoStream {
            name: name.into(),
            prefix: prefix.into(),
        });
        self
    }

    async fn ensure_stream(&self, subject: &str) -> Result<()> {
        let Some(auto) = self.auto_streams.iter().find(|s| s.covers(subject)) else {
            return Ok(());
        };
        let mut ready = self.ready.lock().await;
        if ready.contains(&auto.name) {
            return Ok(());
        }
        let sc = jetstream::stream::Config {
            name: auto.name.clone(),
            subjects: vec![format!("{}.>", auto.prefix)],
            storage: StorageType::File,
            ..Default::default()
        };
        self.js
            .get_or_create_stream(sc)
            .await
            .map_err(|e| PipelineError::Publish {
                subject: subject.to_string(),
                message: format!("stream {}: {e}", auto.name),
            })?;
        info!("stream {} ready for {}.>", auto.name, auto.prefix);
        ready.insert(auto.name.clone());
        Ok(())
    }
}

#[async_trait]
impl Publisher for JetStreamPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_stream(subject).await?;
        let publish_err = |message: String| PipelineError::Publish {
            subject: subject.to_string(),
            message,
        };

        let ack = self
            .js
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(ack)) => {
                debug!("published to {subject}: stream={} sequence={}", ack.stream, ack.sequence);
                Ok(())
            }
            Ok(Err(e)) => Err(publish_err(format!("ack failed: {e}"))),
            Err(_) => Err(publish_err(format!("ack timed out after {:?}", self.ack_timeout))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOutReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Serializes records and hands them to a [`Publisher`].
#[derive(Clone)]
pub struct ResultPublisher {
    publisher: Arc<dyn Publisher>,
    fanout: FanOutConfig,
}

impl ResultPublisher {
    pub fn new(publisher: Arc<dyn Publisher>, fanout: FanOutConfig) -> Self {
        Self { publisher, fanout }
    }

    pub async fn publish_record<T: Serialize + ?Sized>(&self, subject: &str, record: &T) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        self.publisher.publish(subject, payload).await
    }

    /// Publish every record independently. Individual failures are logged
    /// and counted; the fan-out always runs to completion.
    pub async fn fan_out<T: Serialize + Sync>(&self, subject: &str, records: &[T]) -> FanOutReport {
        let attempted = records.len();
        let failed = AtomicUsize::new(0);
        let succeeded = AtomicUsize::new(0);
        let progress_every = self.fanout.progress_every.max(1);
        let (failed_count, succeeded_count) = (&failed, &succeeded);

        stream::iter(records)
            .map(|record| async move {
                match self.publish_record(subject, record).await {
                    Ok(()) => {
                        let done = succeeded_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if done % progress_every == 0 {
                            info!("fan-out to {subject}: {done}/{attempted} published");
                        }
                    }
                    Err(e) => {
                        failed_count.fetch_add(1, Ordering::Relaxed);
                        warn!("fan-out to {subject} failed: {e}");
                    }
                }
            })
            .buffer_unordered(self.fanout.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        let report = FanOutReport {
            attempted,
            succeeded: succeeded.into_inner(),
            failed: failed.into_inner(),
        };
        if report.failed > 0 {
            metrics::FANOUT_PUBLISH_FAILURES_TOTAL.inc_by(report.failed as u64);
            error!(
                "fan-out to {subject}: {} of {} publishes failed",
                report.failed, report.attempted
            );
        }
        report
    }
}
