use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nabory_core::{NewOpportunity, NewScrapingLog, NewSource, Opportunity, ScrapingLog, Source};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity with content hash {content_hash} already exists")]
    Duplicate { content_hash: String },
    #[error("source {0} not found")]
    SourceNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

/// Result of seeding one source; existing rows are never overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    Inserted(Source),
    Existing(Source),
}

impl SeedOutcome {
    pub fn source(&self) -> &Source {
        match self {
            SeedOutcome::Inserted(s) | SeedOutcome::Existing(s) => s,
        }
    }
}

pub const DEFAULT_QUERY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpportunityQuery {
    pub search: Option<String>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn non_wildcard(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "all")
}

impl OpportunityQuery {
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn region_filter(&self) -> Option<&str> {
        non_wildcard(&self.region)
    }

    pub fn status_filter(&self) -> Option<&str> {
        non_wildcard(&self.status)
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).max(1)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub name: String,
    pub region: String,
    #[serde(rename = "type")]
    pub source_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpportunityListing {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub source: SourceSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpportunityPage {
    pub data: Vec<OpportunityListing>,
    pub total: u64,
}

/// Persistence boundary consumed by the ingestion pipeline.
///
/// `create_opportunity` must reject a second row with the same `content_hash`
/// with [`StoreError::Duplicate`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Active sources ordered by name; `take = None` means all remaining.
    async fn list_active_sources(
        &self,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<Source>, StoreError>;

    async fn find_source(&self, id: Uuid) -> Result<Option<Source>, StoreError>;

    async fn update_last_scraped(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError>;

    async fn append_scraping_log(&self, entry: NewScrapingLog) -> Result<ScrapingLog, StoreError>;

    async fn count_opportunities(&self) -> Result<u64, StoreError>;

    async fn list_opportunities_by_scraped_at_desc(&self) -> Result<Vec<Opportunity>, StoreError>;

    async fn delete_opportunities(&self, ids: &[Uuid]) -> Result<u64, StoreError>;

    async fn upsert_source(&self, source: NewSource) -> Result<SeedOutcome, StoreError>;

    async fn search_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> Result<OpportunityPage, StoreError>;

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapingLog>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    opportunities: Vec<Opportunity>,
    logs: Vec<ScrapingLog>,
}

/// In-process store with the same uniqueness rules as the database schema.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an opportunity without the content-hash check, as rows imported
    /// before the constraint existed would be.
    pub async fn insert_unchecked(&self, opportunity: Opportunity) {
        self.state.lock().await.opportunities.push(opportunity);
    }

    pub async fn set_source_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SourceNotFound(id))?;
        source.active = active;
        Ok(())
    }

    pub async fn sources(&self) -> Vec<Source> {
        self.state.lock().await.sources.clone()
    }

    pub async fn opportunities(&self) -> Vec<Opportunity> {
        self.state.lock().await.opportunities.clone()
    }

    pub async fn logs(&self) -> Vec<ScrapingLog> {
        self.state.lock().await.logs.clone()
    }
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn list_active_sources(
        &self,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<Source>, StoreError> {
        let state = self.state.lock().await;
        let mut active = state
            .sources
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect::<Vec<_>>();
        active.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(active
            .into_iter()
            .skip(skip)
            .take(take.unwrap_or(usize::MAX))
            .collect())
    }

    async fn find_source(&self, id: Uuid) -> Result<Option<Source>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn update_last_scraped(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SourceNotFound(id))?;
        source.last_scraped = Some(at);
        Ok(())
    }

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError> {
        let mut state = self.state.lock().await;
        if !state.sources.iter().any(|s| s.id == new.source_id) {
            return Err(StoreError::SourceNotFound(new.source_id));
        }
        if state
            .opportunities
            .iter()
            .any(|o| o.content_hash == new.content_hash)
        {
            return Err(StoreError::Duplicate {
                content_hash: new.content_hash,
            });
        }
        let opportunity = new.into_opportunity(Uuid::new_v4());
        state.opportunities.push(opportunity.clone());
        Ok(opportunity)
    }

    async fn append_scraping_log(&self, entry: NewScrapingLog) -> Result<ScrapingLog, StoreError> {
        let mut state = self.state.lock().await;
        if !state.sources.iter().any(|s| s.id == entry.source_id) {
            return Err(StoreError::SourceNotFound(entry.source_id));
        }
        let log = ScrapingLog {
            id: Uuid::new_v4(),
            source_id: entry.source_id,
            timestamp: Utc::now(),
            status: entry.status,
            items_found: entry.items_found,
            error_message: entry.error_message,
        };
        state.logs.push(log.clone());
        Ok(log)
    }

    async fn count_opportunities(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.opportunities.len() as u64)
    }

    async fn list_opportunities_by_scraped_at_desc(&self) -> Result<Vec<Opportunity>, StoreError> {
        let mut all = self.state.lock().await.opportunities.clone();
        all.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at));
        Ok(all)
    }

    async fn delete_opportunities(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.opportunities.len();
        state.opportunities.retain(|o| !ids.contains(&o.id));
        Ok((before - state.opportunities.len()) as u64)
    }

    async fn upsert_source(&self, source: NewSource) -> Result<SeedOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sources.iter().find(|s| s.url == source.url) {
            return Ok(SeedOutcome::Existing(existing.clone()));
        }
        let created = Source {
            id: Uuid::new_v4(),
            name: source.name,
            url: source.url,
            region: source.region,
            source_type: source.source_type,
            active: source.active,
            last_scraped: None,
        };
        state.sources.push(created.clone());
        Ok(SeedOutcome::Inserted(created))
    }

    async fn search_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> Result<OpportunityPage, StoreError> {
        let state = self.state.lock().await;
        let sources: HashMap<Uuid, &Source> = state.sources.iter().map(|s| (s.id, s)).collect();
        let needle = query.search_term().map(str::to_lowercase);

        let mut matching = state
            .opportunities
            .iter()
            .filter_map(|o| sources.get(&o.source_id).map(|s| (o, *s)))
            .filter(|(_, s)| query.region_filter().is_none_or(|r| s.region == r))
            .filter(|(o, _)| query.status_filter().is_none_or(|st| o.status == st))
            .filter(|(o, _)| {
                needle.as_deref().is_none_or(|n| {
                    contains_ci(&o.title, n) || contains_ci(&o.institution, n)
                })
            })
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.0.scraped_at.cmp(&a.0.scraped_at));

        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit())
            .map(|(o, s)| OpportunityListing {
                opportunity: o.clone(),
                source: SourceSummary {
                    name: s.name.clone(),
                    region: s.region.clone(),
                    source_type: s.source_type.clone(),
                },
            })
            .collect();
        Ok(OpportunityPage { data, total })
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapingLog>, StoreError> {
        let state = self.state.lock().await;
        let mut logs = state.logs.clone();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }
}
