//! Records published downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::asset::FeedMessage;
use crate::policy::{ConstraintConfig, RawMatch};

/// The one verdict published for every inbound feed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStatus {
    pub asset_name: String,
    pub asset_inventory_timestamp: Option<DateTime<Utc>>,
    pub asset_inventory_origin: String,
    pub rule_name: String,
    pub rule_deployment_timestamp: DateTime<Utc>,
    pub compliant: bool,
    pub deleted: bool,
}

impl ComplianceStatus {
    /// Deleted assets are always compliant: nothing is left to violate.
    pub fn for_feed(feed: &FeedMessage, function: &FunctionConfig, compliant: bool) -> Self {
        Self {
            asset_name: feed.asset.name.clone(),
            asset_inventory_timestamp: feed.start_time(),
            asset_inventory_origin: feed.origin.clone(),
            rule_name: function.function_name.clone(),
            rule_deployment_timestamp: function.deployment_time,
            compliant: feed.deleted || compliant,
            deleted: feed.deleted,
        }
    }
}

/// Identity of the deployed rule instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    pub function_name: String,
    pub project_id: String,
    pub environment: String,
    pub deployment_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonCompliance {
    pub message: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub non_compliance: NonCompliance,
    pub function_config: FunctionConfig,
    pub constraint_config: ConstraintConfig,
    pub feed_message: FeedMessage,
    /// Verbatim decision source that produced the verdict.
    pub rule_source: String,
}

impl Violation {
    pub fn from_match(
        raw: RawMatch,
        function: &FunctionConfig,
        feed: &FeedMessage,
        rule_source: &str,
    ) -> Self {
        Self {
            non_compliance: NonCompliance {
                message: raw.violation.msg,
                metadata: raw.violation.details,
            },
            function_config: function.clone(),
            constraint_config: raw.constraint_config,
            feed_message: feed.clone(),
            rule_source: rule_source.to_string(),
        }
    }
}
