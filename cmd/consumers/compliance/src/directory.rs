//! Directory entities: groups, group members and group settings.
//!
//! Upserts are cached and republished on per-customer topics. Deletions
//! carry only email addresses, so the last cached record is looked up by
//! predicate and republished as deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ancestry::Resolution;
use crate::asset::{Asset, FeedMessage, Window, DEFAULT_ORIGIN};
use crate::cache::{document_id, CacheStore, Predicate};
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::publish::ResultPublisher;

pub const GROUP_ASSET_TYPE: &str = "www.googleapis.com/admin/directory/groups";
pub const MEMBER_ASSET_TYPE: &str = "www.googleapis.com/admin/directory/members";
pub const GROUP_SETTINGS_ASSET_TYPE: &str = "groupssettings.googleapis.com/groupSettings";

const GROUPS_TOPIC: &str = "groups";
const MEMBERS_TOPIC: &str = "groupMembers";
const SETTINGS_TOPIC: &str = "groupSettings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEvent {
    pub customer_id: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub change: DirectoryChange,
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DirectoryChange {
    GroupUpsert {
        group: Value,
    },
    GroupDeleted {
        #[serde(rename = "groupEmail")]
        group_email: String,
    },
    MemberUpsert {
        group: GroupRef,
        member: Value,
    },
    MemberDeleted {
        #[serde(rename = "groupEmail")]
        group_email: String,
        #[serde(rename = "memberEmail")]
        member_email: String,
    },
    /// Full membership listing of one group from a directory crawl.
    GroupMembers {
        group: Value,
        members: Vec<Value>,
    },
    GroupSettings {
        #[serde(rename = "groupEmail")]
        group_email: String,
        settings: Value,
    },
}

impl DirectoryChange {
    fn label(&self) -> &'static str {
        match self {
            DirectoryChange::GroupUpsert { .. } => "groupUpsert",
            DirectoryChange::GroupDeleted { .. } => "groupDeleted",
            DirectoryChange::MemberUpsert { .. } => "memberUpsert",
            DirectoryChange::MemberDeleted { .. } => "memberDeleted",
            DirectoryChange::GroupMembers { .. } => "groupMembers",
            DirectoryChange::GroupSettings { .. } => "groupSettings",
        }
    }
}

fn required_str<'a>(doc: &'a Value, field: &str, what: &str) -> Result<&'a str> {
    doc.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::MalformedInput(format!("{what} has no {field}")))
}

fn directory_asset(name: String, asset_type: &str, ancestors: Vec<String>, data: Value) -> Asset {
    let mut asset = Asset {
        name,
        asset_type: asset_type.to_string(),
        ancestors,
        resource: Some(json!({ "data": data })),
        ..Default::default()
    };
    Resolution {
        display_names: asset.ancestors.clone(),
        project_id: None,
    }
    .apply(&mut asset);
    asset
}

pub fn group_asset(customer_id: &str, group: &Value) -> Result<Asset> {
    let group_id = required_str(group, "id", "group")?;
    Ok(directory_asset(
        format!("//directories/{customer_id}/groups/{group_id}"),
        GROUP_ASSET_TYPE,
        vec![format!("directories/{customer_id}")],
        group.clone(),
    ))
}

/// The member document plus `groupEmail`, so member deletions can be
/// matched by group.
pub fn member_asset(customer_id: &str, group: &GroupRef, member: &Value) -> Result<Asset> {
    let member_id = required_str(member, "id", "member")?;
    let mut data = member.clone();
    match data.as_object_mut() {
        Some(fields) => {
            fields.insert("groupEmail".to_string(), Value::String(group.email.clone()));
        }
        None => {
            return Err(PipelineError::MalformedInput(
                "member is not an object".to_string(),
            ))
        }
    }
    Ok(directory_asset(
        format!(
            "//directories/{customer_id}/groups/{}/members/{member_id}",
            group.id
        ),
        MEMBER_ASSET_TYPE,
        vec![
            format!("groups/{}", group.id),
            format!("directories/{customer_id}"),
        ],
        data,
    ))
}

pub fn group_settings_asset(customer_id: &str, group_email: &str, settings: &Value) -> Asset {
    directory_asset(
        format!("//groupssettings.googleapis.com/groups/{group_email}"),
        GROUP_SETTINGS_ASSET_TYPE,
        vec![format!("directories/{customer_id}")],
        settings.clone(),
    )
}

fn data_field(doc: &Value, field: &str) -> Option<String> {
    doc.pointer(&format!("/asset/resource/data/{field}"))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
}

fn is_type(doc: &Value, asset_type: &str) -> bool {
    let found = doc
        .pointer("/asset/assetType")
        .or_else(|| doc.pointer("/asset/asset_type"))
        .and_then(Value::as_str);
    found == Some(asset_type)
}

pub struct DirectoryReconciler {
    cache: Arc<dyn CacheStore>,
    publisher: ResultPublisher,
    subject_prefix: String,
}

impl DirectoryReconciler {
    pub fn new(cache: Arc<dyn CacheStore>, publisher: ResultPublisher, subject_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            publisher,
            subject_prefix: subject_prefix.into(),
        }
    }

    pub fn topic(&self, kind: &str, customer_id: &str) -> String {
        format!("{}.{kind}.{customer_id}", self.subject_prefix)
    }

    fn feed(&self, event: &DirectoryEvent, asset: Asset, deleted: bool) -> FeedMessage {
        FeedMessage {
            asset,
            deleted,
            origin: event.origin.clone(),
            window: Some(Window {
                start_time: event.timestamp,
            }),
            step_stack: None,
        }
    }

    /// Handle one directory event; returns how many records were published.
    pub async fn handle(&self, event: &DirectoryEvent) -> Result<usize> {
        let customer = event.customer_id.as_str();
        debug!(
            "directory event {} customer={} origin={}",
            event.change.label(),
            customer,
            event.origin
        );
        match &event.change {
            DirectoryChange::GroupUpsert { group } => {
                let feed = self.feed(event, group_asset(customer, group)?, false);
                self.upsert(&feed, &self.topic(GROUPS_TOPIC, customer)).await?;
                Ok(1)
            }
            DirectoryChange::MemberUpsert { group, member } => {
                let feed = self.feed(event, member_asset(customer, group, member)?, false);
                self.upsert(&feed, &self.topic(MEMBERS_TOPIC, customer)).await?;
                Ok(1)
            }
            DirectoryChange::GroupSettings {
                group_email,
                settings,
            } => {
                let feed = self.feed(event, group_settings_asset(customer, group_email, settings), false);
                self.publisher
                    .publish_record(&self.topic(SETTINGS_TOPIC, customer), &feed)
                    .await?;
                Ok(1)
            }
            DirectoryChange::GroupMembers { group, members } => {
                self.group_listing(event, group, members).await
            }
            DirectoryChange::GroupDeleted { group_email } => {
                self.group_deleted(event, group_email).await
            }
            DirectoryChange::MemberDeleted {
                group_email,
                member_email,
            } => self.member_deleted(event, group_email, member_email).await,
        }
    }

    async fn upsert(&self, feed: &FeedMessage, subject: &str) -> Result<()> {
        self.cache
            .put(&document_id(&feed.asset.name), &serde_json::to_value(feed)?)
            .await?;
        self.publisher.publish_record(subject, feed).await
    }

    async fn group_listing(&self, event: &DirectoryEvent, group: &Value, members: &[Value]) -> Result<usize> {
        let customer = event.customer_id.as_str();
        let group_feed = self.feed(event, group_asset(customer, group)?, false);
        self.upsert(&group_feed, &self.topic(GROUPS_TOPIC, customer))
            .await?;

        let group_ref = GroupRef {
            id: required_str(group, "id", "group")?.to_string(),
            email: required_str(group, "email", "group")?.to_string(),
        };
        let mut member_feeds = Vec::with_capacity(members.len());
        for member in members {
            match member_asset(customer, &group_ref, member) {
                Ok(asset) => member_feeds.push(self.feed(event, asset, false)),
                Err(e) => warn!("skipping member of {}: {e}", group_ref.email),
            }
        }
        for feed in &member_feeds {
            self.cache
                .put(&document_id(&feed.asset.name), &serde_json::to_value(feed)?)
                .await?;
        }

        let report = self
            .publisher
            .fan_out(&self.topic(MEMBERS_TOPIC, customer), &member_feeds)
            .await;
        info!(
            "group {} listing: {} of {} members published",
            group_ref.email, report.succeeded, report.attempted
        );
        Ok(1 + report.succeeded)
    }

    async fn group_deleted(&self, event: &DirectoryEvent, group_email: &str) -> Result<usize> {
        let customer = event.customer_id.as_str();
        let email = group_email.to_lowercase();
        let groups = self
            .reconstruct(event, &|doc: &Value| {
                is_type(doc, GROUP_ASSET_TYPE) && data_field(doc, "email").as_deref() == Some(email.as_str())
            })
            .await?;
        if groups.is_empty() {
            self.reconstruction_miss(event, &format!("group {group_email}"));
            return Ok(0);
        }

        let members = self
            .reconstruct(event, &|doc: &Value| {
                is_type(doc, MEMBER_ASSET_TYPE)
                    && data_field(doc, "groupEmail").as_deref() == Some(email.as_str())
            })
            .await?;

        let groups_report = self
            .publisher
            .fan_out(&self.topic(GROUPS_TOPIC, customer), &groups)
            .await;
        let members_report = self
            .publisher
            .fan_out(&self.topic(MEMBERS_TOPIC, customer), &members)
            .await;
        info!(
            "group {group_email} deleted: {} group and {} member records republished",
            groups_report.succeeded, members_report.succeeded
        );
        Ok(groups_report.succeeded + members_report.succeeded)
    }

    async fn member_deleted(&self, event: &DirectoryEvent, group_email: &str, member_email: &str) -> Result<usize> {
        let customer = event.customer_id.as_str();
        let group = group_email.to_lowercase();
        let member = member_email.to_lowercase();
        let matches = self
            .reconstruct(event, &|doc: &Value| {
                is_type(doc, MEMBER_ASSET_TYPE)
                    && data_field(doc, "email").as_deref() == Some(member.as_str())
                    && data_field(doc, "groupEmail").as_deref() == Some(group.as_str())
            })
            .await?;
        if matches.is_empty() {
            self.reconstruction_miss(event, &format!("member {member_email} of {group_email}"));
            return Ok(0);
        }
        let report = self
            .publisher
            .fan_out(&self.topic(MEMBERS_TOPIC, customer), &matches)
            .await;
        Ok(report.succeeded)
    }

    /// Cached records accepted by `predicate`, rebuilt as deletions stamped
    /// with the event's timestamp and origin.
    async fn reconstruct(
        &self,
        event: &DirectoryEvent,
        predicate: &Predicate<'_>,
    ) -> Result<Vec<FeedMessage>> {
        let found = self.cache.find(predicate).await?;
        let mut rebuilt = Vec::with_capacity(found.len());
        for doc in found {
            match serde_json::from_value::<FeedMessage>(doc) {
                Ok(cached) => rebuilt.push(self.feed(event, cached.asset, true)),
                Err(e) => warn!("ignoring undecodable cache record: {e}"),
            }
        }
        rebuilt.sort_by(|a, b| a.asset.name.cmp(&b.asset.name));
        Ok(rebuilt)
    }

    fn reconstruction_miss(&self, event: &DirectoryEvent, what: &str) {
        metrics::RECONSTRUCTION_MISSES_TOTAL.inc();
        error!(
            "no cached record for deleted {what} customer={} origin={} timestamp={}",
            event.customer_id,
            event.origin,
            event.timestamp.to_rfc3339()
        );
    }
}
