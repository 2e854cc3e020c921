use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::enrichment::{Enricher, EnrichmentError};
use crate::error::{Error, Result};
use crate::models::{Article, Priority};
use crate::pagination::{self, BoundsPolicy, Window};
use crate::ranking::RankingEngine;
use crate::store::{ArticleFlag, ArticleStore, ProjectionFilter, TagStore};
use crate::tag::{sorted_names, TagService};

/// Age-based deletion rule for the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub keep_saved: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::weeks(1),
            keep_saved: false,
        }
    }
}

pub struct ArticleService {
    store: Arc<dyn ArticleStore>,
    tags: TagService,
    dedup: Deduplicator,
    enricher: Arc<dyn Enricher>,
    ranking: RankingEngine,
    bounds: BoundsPolicy,
    retention: RetentionPolicy,
}

impl ArticleService {
    pub fn new(store: Arc<dyn ArticleStore>, tag_store: Arc<dyn TagStore>, enricher: Arc<dyn Enricher>) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            tags: TagService::new(tag_store),
            store,
            enricher,
            ranking: RankingEngine::default(),
            bounds: BoundsPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_ranking(mut self, ranking: RankingEngine) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_bounds(mut self, bounds: BoundsPolicy) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn tags(&self) -> &TagService {
        &self.tags
    }

    /// Ranked window over unread articles, fully hydrated.
    pub async fn get_ranked_page(&self, from: i64, to: i64) -> Result<Vec<Article>> {
        let window = Window::new(from, to);
        window.precheck(self.bounds)?;

        let candidates = self.store.select_projections(ProjectionFilter::Unread).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        // Reject an impossible window before paying for the tag lookup.
        window.resolve(candidates.len(), self.bounds)?;

        let ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
        let signals = self.tags.importance(&ids).await;
        let ranked = self.ranking.rank(candidates, &signals);

        pagination::page(self.store.as_ref(), &ranked, window, self.bounds, &signals).await
    }

    /// Read articles, most recently read first.
    pub async fn get_history_page(&self, from: i64, to: i64) -> Result<Vec<Article>> {
        self.listing(ProjectionFilter::Read, Window::new(from, to)).await
    }

    pub async fn get_saved_page(&self, from: i64, to: i64) -> Result<Vec<Article>> {
        self.listing(ProjectionFilter::Saved, Window::new(from, to)).await
    }

    pub async fn get_feed_page(&self, feed_id: Uuid, from: i64, to: i64) -> Result<Vec<Article>> {
        Self::require_id(feed_id)?;
        self.listing(ProjectionFilter::Feed(feed_id), Window::new(from, to)).await
    }

    /// Unranked views keep the store's order and only look up tags for the
    /// requested window.
    async fn listing(&self, filter: ProjectionFilter, window: Window) -> Result<Vec<Article>> {
        window.precheck(self.bounds)?;
        let ordered = self.store.select_projections(filter).await?;
        let range = window.resolve(ordered.len(), self.bounds)?;

        let ids: Vec<Uuid> = ordered[range].iter().map(|p| p.id).collect();
        let signals = self.tags.importance(&ids).await;
        pagination::hydrate(self.store.as_ref(), &ids, &signals).await
    }

    pub async fn get_article(&self, id: Uuid) -> Result<Article> {
        Self::require_id(id)?;
        let mut article = self
            .store
            .select_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("article", id))?;
        let signals = self.tags.importance(&[id]).await;
        article.tags = sorted_names(signals.get(&id));
        Ok(article)
    }

    pub async fn get_all(&self) -> Result<Vec<Article>> {
        let mut articles = self.store.select_all().await?;
        let ids: Vec<Uuid> = articles.iter().map(|a| a.id).collect();
        let signals = self.tags.importance(&ids).await;
        for article in &mut articles {
            article.tags = sorted_names(signals.get(&article.id));
        }
        Ok(articles)
    }

    /// Stores a freshly fetched article exactly once.
    ///
    /// Returns [`Error::DuplicateContent`] for content that is already
    /// stored. Enrichment problems never fail the save; the article goes in
    /// with whatever tags and priority could be obtained.
    pub async fn save_ingested(&self, mut article: Article) -> Result<()> {
        // Checked up front as well so repeats never reach the enricher.
        if self.dedup.is_duplicate(&article.content_hash).await? {
            return Err(Error::DuplicateContent(article.content_hash));
        }

        let (tags, priority) = self.enrich(&article).await;
        article.priority = priority;
        self.dedup.save(&article).await?;

        if let Err(e) = self.tags.assign(article.id, &tags).await {
            warn!("Stored article {} without its tags: {}", article.id, e);
        }
        debug!("Stored article {} ({:?})", article.id, article.title);
        Ok(())
    }

    async fn enrich(&self, article: &Article) -> (Vec<String>, Option<Priority>) {
        if !self.enricher.is_enabled() {
            return (Vec::new(), None);
        }

        let known = match self.tags.known_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Could not load known tags, enriching without them: {}", e);
                Vec::new()
            }
        };

        let tags = match self
            .enricher
            .generate_tags(&known, &article.title, &article.description)
            .await
        {
            Ok(tags) => tags,
            Err(e) => {
                degraded("tags", &article.title, e);
                Vec::new()
            }
        };

        let priority = match self
            .enricher
            .generate_priority(&article.title, &article.description)
            .await
        {
            Ok(priority) => Some(priority),
            Err(e) => {
                degraded("priority", &article.title, e);
                None
            }
        };

        (tags, priority)
    }

    pub async fn mark_saved(&self, id: Uuid, saved: bool) -> Result<()> {
        self.update_flag(id, ArticleFlag::Saved(saved)).await
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<()> {
        self.update_flag(id, ArticleFlag::ReadAt(Utc::now())).await
    }

    async fn update_flag(&self, id: Uuid, flag: ArticleFlag) -> Result<()> {
        Self::require_id(id)?;
        if !self.store.update_flag(id, flag).await? {
            return Err(Error::not_found("article", id));
        }
        Ok(())
    }

    /// Deletes articles older than the retention age. Returns the count.
    pub async fn run_retention_sweep(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.retention.max_age;
        let deleted = self
            .store
            .delete_older_than(cutoff, self.retention.keep_saved)
            .await?;
        info!(
            "Retention sweep removed {} articles published before {}",
            deleted,
            cutoff.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(deleted)
    }

    fn require_id(id: Uuid) -> Result<()> {
        if id.is_nil() {
            return Err(Error::Validation("id must not be nil".to_string()));
        }
        Ok(())
    }
}

fn degraded(what: &str, title: &str, err: EnrichmentError) {
    let err = Error::EnrichmentDegraded(format!("{} for {:?}: {}", what, title, err));
    warn!("{}", err);
}
