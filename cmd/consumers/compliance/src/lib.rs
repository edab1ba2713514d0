//! Asset reconciliation and compliance evaluation for ServiceRadar.
//!
//! Inbound asset-change and directory events are normalized, reconciled
//! against an ancestor hierarchy and a historical cache, evaluated by a
//! zen decision, and republished as compliance status and violation records.

pub mod ancestry;
pub mod asset;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod hierarchy;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod pipeline;
pub mod policy;
pub mod publish;
pub mod records;
pub mod retry;
pub mod rule_loader;
pub mod server;

pub use error::{PipelineError, Result};
pub use pipeline::{Outcome, Pipeline, PipelineSettings};
