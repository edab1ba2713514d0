use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, Consumer},
    stream::{Config as StreamConfig, StorageType},
};
use async_nats::{Client, ConnectOptions};
use log::{info, warn};
use std::path::PathBuf;

use crate::config::Config;

pub async fn connect_nats(cfg: &Config) -> Result<(Client, jetstream::Context)> {
    let mut opts = ConnectOptions::new().name("serviceradar-compliance");
    if let Some(sec) = &cfg.security {
        if let Some(ca) = &sec.ca_file {
            opts = opts.add_root_certificates(PathBuf::from(ca));
        }
        if let (Some(cert), Some(key)) = (&sec.cert_file, &sec.key_file) {
            opts = opts.add_client_certificate(PathBuf::from(cert), PathBuf::from(key));
        }
    }
    let client = opts
        .connect(&cfg.nats_url)
        .await
        .with_context(|| format!("failed to connect to nats at {}", cfg.nats_url))?;
    info!("connected to nats at {}", cfg.nats_url);
    let js = match &cfg.domain {
        Some(domain) => jetstream::with_domain(client.clone(), domain),
        None => jetstream::new(client.clone()),
    };
    Ok((client, js))
}

/// Bind the durable pull consumer, creating the inbound stream when it does
/// not exist yet. A consumer whose filter no longer matches `subjects` is
/// recreated.
pub async fn ensure_consumer(
    cfg: &Config,
    js: &jetstream::Context,
) -> Result<Consumer<PullConfig>> {
    let stream = match js.get_stream(&cfg.stream_name).await {
        Ok(s) => s,
        Err(_) => {
            let sc = StreamConfig {
                name: cfg.stream_name.clone(),
                subjects: cfg.subjects.clone(),
                storage: StorageType::File,
                ..Default::default()
            };
            js.get_or_create_stream(sc)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
    };
    info!("using stream {}", cfg.stream_name);

    let desired_cfg = PullConfig {
        durable_name: Some(cfg.consumer_name.clone()),
        filter_subjects: cfg.subjects.clone(),
        ..Default::default()
    };
    let consumer = match stream.consumer_info(&cfg.consumer_name).await {
        Ok(info) if info.config.filter_subjects != cfg.subjects => {
            warn!(
                "consumer {} configuration changed, recreating",
                cfg.consumer_name
            );
            stream
                .delete_consumer(&cfg.consumer_name)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            stream
                .create_consumer(desired_cfg)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
        Ok(_) => stream
            .get_consumer(&cfg.consumer_name)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        Err(_) => stream
            .create_consumer(desired_cfg)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    };
    info!("using consumer {}", cfg.consumer_name);
    Ok(consumer)
}
