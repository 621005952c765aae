//! Campaigns and subscribers
//!
//! The content store is owned by the surrounding platform. The pipeline reads
//! campaigns and subscribers through [`CampaignStore`] and only ever changes a
//! campaign's status, always as a compare-and-set.

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::CampaignStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignStatus {
    Draft,
    Sending,
    Sent,
    Failed,
}

impl Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        })
    }
}

/// Which subscribers a campaign targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    /// Everyone who has not unsubscribed
    #[default]
    All,
    VerifiedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub audience: Audience,
    pub status: CampaignStatus,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub sent_at: Option<SystemTime>,
}

impl Campaign {
    /// A new draft campaign
    pub fn draft(
        id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        audience: Audience,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            subject: subject.into(),
            body: body.into(),
            audience,
            status: CampaignStatus::Draft,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberStatus {
    Pending,
    Verified,
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub status: SubscriberStatus,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, email: impl Into<String>, status: SubscriberStatus) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            status,
        }
    }

    #[must_use]
    pub const fn is_eligible(&self, audience: Audience) -> bool {
        match audience {
            Audience::All => !matches!(self.status, SubscriberStatus::Unsubscribed),
            Audience::VerifiedOnly => matches!(self.status, SubscriberStatus::Verified),
        }
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// [`CampaignStoreError::NotFound`] if the campaign does not exist.
    async fn get_campaign(&self, id: &str) -> Result<Campaign, CampaignStoreError>;

    /// Campaigns ordered newest first
    async fn list_campaigns(&self, limit: usize) -> Result<Vec<Campaign>, CampaignStoreError>;

    /// Returns `Ok(None)` for an unknown subscriber
    async fn get_subscriber(&self, id: &str) -> Result<Option<Subscriber>, CampaignStoreError>;

    /// Subscribers the audience selects, in a stable order
    async fn eligible_subscribers(
        &self,
        audience: Audience,
    ) -> Result<Vec<Subscriber>, CampaignStoreError>;

    /// Move a campaign from `from` to `to` if it is still in `from`
    ///
    /// Moving to [`CampaignStatus::Sent`] also stamps `sent_at`.
    ///
    /// # Errors
    ///
    /// [`CampaignStoreError::InvalidTransition`] if the campaign is no longer
    /// in `from`.
    async fn transition(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Campaign, CampaignStoreError>;
}

/// In-process content store for tests and the demo daemon
#[derive(Debug, Clone, Default)]
pub struct MemoryCampaignStore {
    campaigns: Arc<DashMap<String, Campaign>>,
    subscribers: Arc<DashMap<String, Subscriber>>,
}

impl MemoryCampaignStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id.clone(), campaign);
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.id.clone(), subscriber);
    }

    /// Change a subscriber's status, as the platform does on opt-out
    pub fn set_subscriber_status(&self, id: &str, status: SubscriberStatus) -> bool {
        self.subscribers
            .get_mut(id)
            .map(|mut subscriber| subscriber.status = status)
            .is_some()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn get_campaign(&self, id: &str) -> Result<Campaign, CampaignStoreError> {
        self.campaigns
            .get(id)
            .map(|campaign| campaign.clone())
            .ok_or_else(|| CampaignStoreError::NotFound(id.to_string()))
    }

    async fn list_campaigns(&self, limit: usize) -> Result<Vec<Campaign>, CampaignStoreError> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        campaigns.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        campaigns.truncate(limit);

        Ok(campaigns)
    }

    async fn get_subscriber(&self, id: &str) -> Result<Option<Subscriber>, CampaignStoreError> {
        Ok(self.subscribers.get(id).map(|subscriber| subscriber.clone()))
    }

    async fn eligible_subscribers(
        &self,
        audience: Audience,
    ) -> Result<Vec<Subscriber>, CampaignStoreError> {
        let mut subscribers: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|entry| entry.is_eligible(audience))
            .map(|entry| entry.value().clone())
            .collect();

        subscribers.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(subscribers)
    }

    async fn transition(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Campaign, CampaignStoreError> {
        let mut campaign = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| CampaignStoreError::NotFound(id.to_string()))?;

        if campaign.status != from {
            return Err(CampaignStoreError::InvalidTransition {
                campaign_id: id.to_string(),
                expected: from,
                actual: campaign.status,
            });
        }

        let now = SystemTime::now();
        campaign.status = to;
        campaign.updated_at = now;
        if to == CampaignStatus::Sent {
            campaign.sent_at = Some(now);
        }

        Ok(campaign.clone())
    }
}
