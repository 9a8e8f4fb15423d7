use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nabory_core::{
    LogStatus, NewOpportunity, NewScrapingLog, NewSource, Opportunity, ScrapingLog, Source,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::catalog::{
    CatalogStore, OpportunityListing, OpportunityPage, OpportunityQuery, SeedOutcome,
    SourceSummary, StoreError,
};

const SOURCE_COLUMNS: &str = "id, name, url, region, source_type, active, last_scraped";

const OPPORTUNITY_COLUMNS: &str = "o.id, o.source_id, o.title, o.institution, o.description, \
     o.beneficiaries, o.date_from, o.date_to, o.deadline, o.amount, o.budget, \
     o.opportunity_type, o.link, o.content_hash, o.scraped_at, o.status";

/// Postgres-backed catalog; the schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn source_from_row(row: &PgRow) -> Result<Source, sqlx::Error> {
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        region: row.try_get("region")?,
        source_type: row.try_get("source_type")?,
        active: row.try_get("active")?,
        last_scraped: row.try_get("last_scraped")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, sqlx::Error> {
    Ok(Opportunity {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        institution: row.try_get("institution")?,
        description: row.try_get("description")?,
        beneficiaries: row.try_get("beneficiaries")?,
        date_from: row.try_get("date_from")?,
        date_to: row.try_get("date_to")?,
        deadline: row.try_get("deadline")?,
        amount: row.try_get("amount")?,
        budget: row.try_get("budget")?,
        opportunity_type: row.try_get("opportunity_type")?,
        link: row.try_get("link")?,
        content_hash: row.try_get("content_hash")?,
        scraped_at: row.try_get("scraped_at")?,
        status: row.try_get("status")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ScrapingLog, StoreError> {
    let status: String = row.try_get("status")?;
    let items_found: i32 = row.try_get("items_found")?;
    Ok(ScrapingLog {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        timestamp: row.try_get("logged_at")?,
        status: status
            .parse::<LogStatus>()
            .map_err(|e| StoreError::Message(e.to_string()))?,
        items_found: u32::try_from(items_found).unwrap_or(0),
        error_message: row.try_get("error_message")?,
    })
}

fn map_insert_error(err: sqlx::Error, content_hash: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate {
                content_hash: content_hash.to_string(),
            };
        }
    }
    StoreError::Database(err)
}

/// OFFSET/LIMIT binds saturate instead of wrapping negative.
fn to_sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn push_listing_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &OpportunityQuery) {
    qb.push(" WHERE TRUE");
    if let Some(region) = query.region_filter() {
        qb.push(" AND s.region = ").push_bind(region.to_string());
    }
    if let Some(status) = query.status_filter() {
        qb.push(" AND o.status = ").push_bind(status.to_string());
    }
    if let Some(term) = query.search_term() {
        let pattern = format!("%{term}%");
        qb.push(" AND (o.title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR o.institution ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list_active_sources(
        &self,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE active ORDER BY name ASC, id ASC \
             OFFSET $1 LIMIT $2"
        ))
        .bind(to_sql_count(skip))
        .bind(take.map(to_sql_count))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(source_from_row).collect::<Result<_, _>>()?)
    }

    async fn find_source(&self, id: Uuid) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(source_from_row).transpose()?)
    }

    async fn update_last_scraped(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sources SET last_scraped = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }
        Ok(())
    }

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError> {
        let content_hash = new.content_hash.clone();
        let fields = &new.fields;
        let row = sqlx::query(&format!(
            r#"
            WITH o AS (
                INSERT INTO opportunities (
                    id, source_id, title, institution, description, beneficiaries,
                    date_from, date_to, deadline, amount, budget, opportunity_type,
                    link, content_hash, scraped_at, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                RETURNING *
            )
            SELECT {OPPORTUNITY_COLUMNS} FROM o
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.source_id)
        .bind(&fields.title)
        .bind(&fields.institution)
        .bind(&fields.description)
        .bind(&fields.beneficiaries)
        .bind(fields.date_from)
        .bind(fields.date_to)
        .bind(fields.deadline)
        .bind(&fields.amount)
        .bind(&fields.budget)
        .bind(&fields.opportunity_type)
        .bind(&fields.link)
        .bind(&new.content_hash)
        .bind(new.scraped_at)
        .bind(&new.status)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, &content_hash))?;
        Ok(opportunity_from_row(&row)?)
    }

    async fn append_scraping_log(&self, entry: NewScrapingLog) -> Result<ScrapingLog, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scraping_logs (id, source_id, logged_at, status, items_found, error_message)
            VALUES ($1, $2, NOW(), $3, $4, $5)
            RETURNING id, source_id, logged_at, status, items_found, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.source_id)
        .bind(entry.status.as_str())
        .bind(i32::try_from(entry.items_found).unwrap_or(i32::MAX))
        .bind(&entry.error_message)
        .fetch_one(&self.pool)
        .await?;
        log_from_row(&row)
    }

    async fn count_opportunities(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_opportunities_by_scraped_at_desc(&self) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities o ORDER BY o.scraped_at DESC, o.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(opportunity_from_row).collect::<Result<_, _>>()?)
    }

    async fn delete_opportunities(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM opportunities WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_source(&self, source: NewSource) -> Result<SeedOutcome, StoreError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO sources (id, name, url, region, source_type, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (url) DO NOTHING
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.region)
        .bind(&source.source_type)
        .bind(source.active)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(SeedOutcome::Inserted(source_from_row(&row)?));
        }

        let existing = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE url = $1"))
            .bind(&source.url)
            .fetch_one(&self.pool)
            .await?;
        Ok(SeedOutcome::Existing(source_from_row(&existing)?))
    }

    async fn search_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> Result<OpportunityPage, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM opportunities o JOIN sources s ON s.id = o.source_id",
        );
        push_listing_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {OPPORTUNITY_COLUMNS}, s.name AS source_name, s.region AS source_region, \
             s.source_type AS source_kind \
             FROM opportunities o JOIN sources s ON s.id = o.source_id"
        ));
        push_listing_filters(&mut qb, query);
        qb.push(" ORDER BY o.scraped_at DESC, o.id LIMIT ")
            .push_bind(to_sql_count(query.limit()))
            .push(" OFFSET ")
            .push_bind(to_sql_count(query.offset()));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            data.push(OpportunityListing {
                opportunity: opportunity_from_row(row)?,
                source: SourceSummary {
                    name: row.try_get("source_name")?,
                    region: row.try_get("source_region")?,
                    source_type: row.try_get("source_kind")?,
                },
            });
        }

        Ok(OpportunityPage {
            data,
            total: total.max(0) as u64,
        })
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapingLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, logged_at, status, items_found, error_message
              FROM scraping_logs
             ORDER BY logged_at DESC
             LIMIT $1
            "#,
        )
        .bind(to_sql_count(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}
