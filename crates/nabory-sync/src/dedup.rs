use std::collections::HashSet;

use nabory_core::Opportunity;
use nabory_storage::{CatalogStore, StoreError};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupReport {
    pub duplicates_removed: u64,
    pub remaining_count: u64,
}

/// Ids to delete from a newest-first listing: every member of a fingerprint group but the first.
pub fn plan_duplicate_removals(newest_first: &[Opportunity]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    newest_first
        .iter()
        .filter(|o| !seen.insert(o.content_hash.as_str()))
        .map(|o| o.id)
        .collect()
}

/// Maintenance scan keeping the most recently scraped member of each fingerprint group.
pub async fn deduplicate(store: &dyn CatalogStore) -> Result<DedupReport, StoreError> {
    let opportunities = store.list_opportunities_by_scraped_at_desc().await?;
    let doomed = plan_duplicate_removals(&opportunities);
    let duplicates_removed = store.delete_opportunities(&doomed).await?;
    let remaining_count = store.count_opportunities().await?;
    info!(duplicates_removed, remaining_count, "deduplication complete");
    Ok(DedupReport {
        duplicates_removed,
        remaining_count,
    })
}
