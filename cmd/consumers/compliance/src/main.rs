use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::AckKind;

use compliance::ancestry::AncestryResolver;
use compliance::cache::{CacheStore, KvCache};
use compliance::config::Config;
use compliance::directory::DirectoryReconciler;
use compliance::hierarchy::ResourceManagerClient;
use compliance::nats::{connect_nats, ensure_consumer};
use compliance::policy::ZenEvaluator;
use compliance::publish::{JetStreamPublisher, ResultPublisher};
use compliance::records::FunctionConfig;
use compliance::server::start_metrics_server;
use compliance::{Outcome, Pipeline, PipelineSettings};

const BATCH_SIZE: usize = 10;
const BATCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "serviceradar-compliance")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "COMPLIANCE_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let cfg = Config::from_file(&cli.config)?;

    let metrics_addr: SocketAddr = cfg
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics_addr {}", cfg.metrics_addr))?;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!("metrics server stopped: {e}");
        }
    });

    let (_client, js) = connect_nats(&cfg).await?;
    let consumer = ensure_consumer(&cfg, &js).await?;

    let cache: Arc<dyn CacheStore> = Arc::new(KvCache::open(&js, &cfg.kv_bucket).await?);
    info!("using cache bucket {}", cfg.kv_bucket);

    let hierarchy = Arc::new(ResourceManagerClient::new(&cfg.hierarchy_api)?);
    let resolver = AncestryResolver::new(cache.clone(), hierarchy, cfg.ancestry.retry_policy());

    let evaluator = Arc::new(ZenEvaluator::new(&cfg.rule.dir, &cfg.rule.name));
    info!(
        "evaluating rule {} from {}",
        cfg.rule.name,
        cfg.rule.dir.display()
    );

    let publisher = Arc::new(
        JetStreamPublisher::new(js.clone(), cfg.publish_timeout())
            .with_auto_stream(
                cfg.directory.subject_prefix.replace('.', "_"),
                cfg.directory.subject_prefix.clone(),
            ),
    );
    let results = ResultPublisher::new(publisher, cfg.fanout.clone());
    let directory = DirectoryReconciler::new(
        cache.clone(),
        results.clone(),
        cfg.directory.subject_prefix.clone(),
    );

    let pipeline = Pipeline::new(
        PipelineSettings::from(&cfg),
        FunctionConfig::from(&cfg),
        cache,
        resolver,
        evaluator,
        results,
        directory,
    );

    info!("waiting for messages on subjects: {:?}", cfg.subjects);

    loop {
        let mut messages = consumer
            .stream()
            .max_messages_per_batch(BATCH_SIZE)
            .expires(BATCH_TIMEOUT)
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        debug!(
            "waiting for up to {} messages or {:?} timeout",
            BATCH_SIZE, BATCH_TIMEOUT
        );
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let sequence = message.info().map(|i| i.stream_sequence).unwrap_or_default();

            let ack = match pipeline.handle(&message.payload).await {
                Outcome::Done => message.ack().await,
                Outcome::Aborted(_) => message.ack_with(AckKind::Term).await,
                Outcome::Failed(_) => message.ack_with(AckKind::Nak(None)).await,
            };
            match ack {
                Ok(()) => debug!("settled message {sequence}"),
                Err(e) => warn!("failed to settle message {sequence}: {e}"),
            }
        }
    }
}
