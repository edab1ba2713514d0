//! Error taxonomy for the compliance pipeline.
//!
//! Every failure site maps onto one [`PipelineError`] variant, and each
//! variant is either retryable (the inbound message is NAKed and redelivered)
//! or terminal (the message is logged and terminated).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Payload is not JSON or matches no known message shape.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A live asset carries neither a resource nor an IAM policy.
    #[error("asset {name} has neither resource nor iamPolicy")]
    EmptyAsset { name: String },

    /// The event is older than the configured maximum age.
    #[error("event for {name} expired: observed {age_secs}s ago")]
    Expired { name: String, age_secs: i64 },

    /// Rule or constraint definitions are missing or unusable.
    #[error("rule configuration error: {0}")]
    RuleConfiguration(String),

    /// The decision engine failed while evaluating.
    #[error("evaluation failed: {message}")]
    Evaluation { message: String, retryable: bool },

    /// The decision engine returned something other than the documented result set.
    #[error("malformed evaluation result: {0}")]
    MalformedResult(String),

    /// An already-computed record could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure talking to the reconciliation cache.
    #[error("cache error: {0}")]
    Cache(String),

    /// Transport failure talking to the hierarchy API. Only raised inside
    /// ancestry resolution, which degrades it to `unknown`; it never decides
    /// an event's outcome.
    #[error("hierarchy API error: {0}")]
    Hierarchy(String),

    /// Transport failure publishing to the bus.
    #[error("publish to {subject} failed: {message}")]
    Publish { subject: String, message: String },
}

impl PipelineError {
    /// Whether redelivering the inbound event could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Cache(_)
            | PipelineError::Hierarchy(_)
            | PipelineError::Publish { .. } => true,
            PipelineError::Evaluation { retryable, .. } => *retryable,
            PipelineError::MalformedInput(_)
            | PipelineError::EmptyAsset { .. }
            | PipelineError::Expired { .. }
            | PipelineError::RuleConfiguration(_)
            | PipelineError::MalformedResult(_)
            | PipelineError::Serialization(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedInput(_) => "malformed_input",
            PipelineError::EmptyAsset { .. } => "empty_asset",
            PipelineError::Expired { .. } => "expired",
            PipelineError::RuleConfiguration(_) => "rule_configuration",
            PipelineError::Evaluation { .. } => "evaluation",
            PipelineError::MalformedResult(_) => "malformed_result",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Cache(_) => "cache",
            PipelineError::Hierarchy(_) => "hierarchy",
            PipelineError::Publish { .. } => "publish",
        }
    }
}
