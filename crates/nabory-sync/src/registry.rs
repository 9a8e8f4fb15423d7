use std::path::Path;

use anyhow::{Context, Result};
use nabory_core::NewSource;
use nabory_storage::{CatalogStore, SeedOutcome};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<NewSource>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub inserted: usize,
    pub existing: usize,
}

/// Inserts unknown urls; sources already present are left untouched.
pub async fn seed_sources(store: &dyn CatalogStore, registry: &SourceRegistry) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for source in &registry.sources {
        let outcome = store
            .upsert_source(source.clone())
            .await
            .with_context(|| format!("seeding source {}", source.url))?;
        match outcome {
            SeedOutcome::Inserted(s) => {
                debug!(source = %s.name, "inserted source");
                report.inserted += 1;
            }
            SeedOutcome::Existing(_) => report.existing += 1,
        }
    }
    info!(inserted = report.inserted, existing = report.existing, "source seeding complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nabory_storage::MemoryCatalogStore;
    use std::io::Write;

    const REGISTRY: &str = r#"
sources:
  - name: "PARP – Harmonogram naborów"
    type: "agencja krajowa"
    region: "kraj"
    url: "https://www.parp.gov.pl/harmonogram-naborow"
  - name: "WUP Kraków"
    type: "WUP"
    region: "małopolskie"
    url: "https://wupkrakow.praca.gov.pl/"
    active: false
"#;

    #[tokio::test]
    async fn load_reads_registry_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();

        let registry = SourceRegistry::load(file.path()).await.unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].source_type, "agencja krajowa");
        assert!(registry.sources[0].active);
        assert!(!registry.sources[1].active);
    }

    #[tokio::test]
    async fn missing_file_is_reported_with_path() {
        let err = SourceRegistry::load(Path::new("/nonexistent/sources.yaml"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/sources.yaml"));
    }

    #[tokio::test]
    async fn seeding_twice_inserts_once_and_keeps_edits() {
        let store = MemoryCatalogStore::new();
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();

        let first = seed_sources(&store, &registry).await.unwrap();
        assert_eq!(first, SeedReport { inserted: 2, existing: 0 });

        let parp = store
            .sources()
            .await
            .into_iter()
            .find(|s| s.url.contains("parp"))
            .unwrap();
        store.set_source_active(parp.id, false).await.unwrap();

        let second = seed_sources(&store, &registry).await.unwrap();
        assert_eq!(second, SeedReport { inserted: 0, existing: 2 });
        let parp_after = store.find_source(parp.id).await.unwrap().unwrap();
        assert!(!parp_after.active);
    }

    #[test]
    fn bundled_registry_parses() {
        let text = include_str!("../../../sources.yaml");
        let registry = SourceRegistry::from_yaml_str(text).unwrap();
        assert_eq!(registry.sources.len(), 49);
        assert!(registry.sources.iter().all(|s| s.url.starts_with("https://")));
    }
}
