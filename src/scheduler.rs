use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SchedulerSettings;
use crate::error::{Error, Result};
use crate::feed::{FetchError, SourceFetcher};
use crate::models::{Article, Feed};
use crate::service::ArticleService;
use crate::store::FeedStore;

/// Counts of one ingestion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub sources: usize,
    pub failed_sources: usize,
    pub saved: usize,
    pub duplicates: usize,
    pub failed_items: usize,
}

/// Shared by the source units of a cycle while they run concurrently.
#[derive(Default)]
struct Tally {
    failed_sources: AtomicUsize,
    saved: AtomicUsize,
    duplicates: AtomicUsize,
    failed_items: AtomicUsize,
}

impl Tally {
    fn report(&self, sources: usize) -> CycleReport {
        CycleReport {
            sources,
            failed_sources: self.failed_sources.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed_items: self.failed_items.load(Ordering::Relaxed),
        }
    }
}

/// Drives periodic ingestion over every registered feed, plus the
/// retention sweep on its own timer.
pub struct Scheduler {
    feeds: Arc<dyn FeedStore>,
    fetcher: Arc<dyn SourceFetcher>,
    articles: Arc<ArticleService>,
    settings: SchedulerSettings,
    retention_every: Duration,
}

impl Scheduler {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        fetcher: Arc<dyn SourceFetcher>,
        articles: Arc<ArticleService>,
        settings: SchedulerSettings,
        retention_every: Duration,
    ) -> Self {
        Self {
            feeds,
            fetcher,
            articles,
            settings,
            retention_every,
        }
    }

    /// One pass over all feeds, at most `concurrency` of them at a time.
    /// A failing source is counted and skipped; only a failure to list the
    /// feeds fails the cycle.
    pub async fn run_ingestion_cycle(&self) -> Result<CycleReport> {
        let feeds = self.feeds.all_feeds().await?;
        let tally = Tally::default();

        stream::iter(feeds.iter())
            .map(|feed| self.ingest_source(feed, &tally))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        let report = tally.report(feeds.len());
        info!(
            "Ingestion cycle done: {} sources ({} failed), {} saved, {} duplicates, {} failed items",
            report.sources, report.failed_sources, report.saved, report.duplicates, report.failed_items
        );
        Ok(report)
    }

    /// Runs the source unit of a single feed right away.
    pub async fn refresh_feed(&self, id: Uuid) -> Result<CycleReport> {
        let feed = self
            .feeds
            .feed_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("feed", id))?;

        let tally = Tally::default();
        self.ingest_source(&feed, &tally).await;
        let report = tally.report(1);
        info!(
            "Refreshed {}: {} saved, {} duplicates, {} failed items",
            feed.name, report.saved, report.duplicates, report.failed_items
        );
        Ok(report)
    }

    pub async fn run_retention_sweep(&self) -> Result<u64> {
        self.articles.run_retention_sweep().await
    }

    /// One source end to end, bounded by `source_timeout`. Items saved
    /// before the budget runs out stay saved and counted.
    async fn ingest_source(&self, feed: &Feed, tally: &Tally) {
        let budget = self.settings.source_timeout();
        if timeout(budget, self.ingest_items(feed, tally)).await.is_err() {
            warn!("Feed {} ran past its {:?} budget, skipping the rest of it", feed.name, budget);
            tally.failed_sources.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn ingest_items(&self, feed: &Feed, tally: &Tally) {
        let deadline = self.settings.fetch_timeout();
        let fetched = match timeout(deadline, self.fetcher.fetch(&feed.url, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(deadline)),
        };

        let items = match fetched {
            Ok(items) => items,
            Err(source) => {
                let err = Error::SourceFetch {
                    url: feed.url.clone(),
                    source,
                };
                warn!("Skipping feed {}: {}", feed.name, err);
                tally.failed_sources.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        debug!("Fetched {} items from {}", items.len(), feed.name);

        for item in items {
            let article = Article::from_item(item, Some(feed.id));
            let title = article.title.clone();
            match self.articles.save_ingested(article).await {
                Ok(()) => {
                    tally.saved.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_duplicate() => {
                    tally.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Failed to save {:?} from {}: {}", title, feed.name, e);
                    tally.failed_items.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Runs ingestion (once immediately, then every interval) and the
    /// retention sweep until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "Scheduler started: ingestion every {:?}, retention every {:?}",
            self.settings.interval(),
            self.retention_every
        );

        tokio::select! {
            _ = self.ingestion_loop() => {}
            _ = self.retention_loop() => {}
            _ = shutdown => info!("Scheduler stopping"),
        }
    }

    async fn ingestion_loop(&self) {
        let mut ticker = interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_ingestion_cycle().await {
                error!("Ingestion cycle failed: {}", e);
            }
        }
    }

    async fn retention_loop(&self) {
        let mut ticker = interval_at(Instant::now() + self.retention_every, self.retention_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_retention_sweep().await {
                error!("Retention sweep failed: {}", e);
            }
        }
    }
}
