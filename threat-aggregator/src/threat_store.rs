//! Persistence sinks: PostgreSQL for deployments, in-memory for tests and
//! one-shot runs.

use crate::types::{PersistenceSink, SinkStats, ThreatRecord, FALLBACK_MODEL};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Pool, Postgres};
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Records ingested within this window count as recent.
const RECENT_WINDOW_HOURS: i64 = 1;

pub struct PostgresSink {
    db: Pool<Postgres>,
}

impl PostgresSink {
    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str) -> crate::types::Result<Self> {
        let db = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("Connected to threat database");
        Ok(Self { db })
    }

    pub fn from_pool(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PersistenceSink for PostgresSink {
    async fn contains_url(&self, url: &str) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM threats WHERE url = $1)")
            .bind(url)
            .fetch_one(&self.db)
            .await?;
        Ok(exists)
    }

    async fn store(&self, record: &ThreatRecord) -> anyhow::Result<bool> {
        let mut tx = self.db.begin().await?;
        let entry = &record.entry;

        let threat_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO threats (id, source_id, title, body, url, author, published_at, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.source_id)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(&entry.url)
        .bind(&entry.author)
        .bind(entry.published_at)
        .bind(record.ingested_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(threat_id) = threat_id else {
            tx.rollback().await?;
            debug!("Threat already stored: {}", entry.url);
            return Ok(false);
        };

        for ioc in record.iocs.candidates() {
            sqlx::query(
                r#"
                INSERT INTO iocs (id, threat_id, ioc_type, value, context, position, confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (threat_id, ioc_type, value) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(threat_id)
            .bind(ioc.ioc_type.as_str())
            .bind(&ioc.value)
            .bind(&ioc.context)
            .bind(i32::try_from(ioc.position).unwrap_or(i32::MAX))
            .bind(ioc.confidence)
            .execute(&mut *tx)
            .await?;
        }

        let analysis = &record.analysis;
        sqlx::query(
            r#"
            INSERT INTO threat_analysis (id, threat_id, summary, threat_type, severity, key_points,
                recommendations, threat_actors, affected_systems, confidence_score, model_used, processing_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(threat_id)
        .bind(&analysis.summary)
        .bind(analysis.threat_type.as_str())
        .bind(analysis.severity.as_str())
        .bind(&analysis.key_points)
        .bind(&analysis.recommendations)
        .bind(&analysis.threat_actors)
        .bind(&analysis.affected_systems)
        .bind(analysis.confidence_score)
        .bind(&analysis.model_used)
        .bind(analysis.processing_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Stored threat {} with {} IOCs", threat_id, record.iocs.total());
        Ok(true)
    }

    async fn stats(&self) -> anyhow::Result<SinkStats> {
        let total_threats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threats")
            .fetch_one(&self.db)
            .await?;

        let ai_analyzed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threat_analysis WHERE model_used <> $1")
            .bind(FALLBACK_MODEL)
            .fetch_one(&self.db)
            .await?;

        let fallback_analyzed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threat_analysis WHERE model_used = $1")
            .bind(FALLBACK_MODEL)
            .fetch_one(&self.db)
            .await?;

        let total_iocs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM iocs")
            .fetch_one(&self.db)
            .await?;

        let recent_threats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threats WHERE ingested_at > $1")
            .bind(Utc::now() - Duration::hours(RECENT_WINDOW_HOURS))
            .fetch_one(&self.db)
            .await?;

        Ok(SinkStats {
            total_threats: total_threats.max(0) as u64,
            ai_analyzed: ai_analyzed.max(0) as u64,
            fallback_analyzed: fallback_analyzed.max(0) as u64,
            total_iocs: total_iocs.max(0) as u64,
            recent_threats: recent_threats.max(0) as u64,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<ThreatRecord>,
    urls: HashSet<String>,
}

/// URL-keyed sink held in process memory. Records keep insertion order.
#[derive(Default)]
pub struct MemorySink {
    state: RwLock<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ThreatRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn contains_url(&self, url: &str) -> anyhow::Result<bool> {
        Ok(self.state.read().await.urls.contains(url))
    }

    async fn store(&self, record: &ThreatRecord) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        if !state.urls.insert(record.entry.url.clone()) {
            return Ok(false);
        }
        state.records.push(record.clone());
        Ok(true)
    }

    async fn stats(&self) -> anyhow::Result<SinkStats> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - Duration::hours(RECENT_WINDOW_HOURS);

        let fallback_analyzed = state.records.iter().filter(|r| r.analysis.model_used == FALLBACK_MODEL).count();

        Ok(SinkStats {
            total_threats: state.records.len() as u64,
            ai_analyzed: (state.records.len() - fallback_analyzed) as u64,
            fallback_analyzed: fallback_analyzed as u64,
            total_iocs: state.records.iter().map(|r| r.iocs.total() as u64).sum(),
            recent_threats: state.records.iter().filter(|r| r.ingested_at > cutoff).count() as u64,
        })
    }
}
