use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Article, ArticleProjection, Feed};
use crate::tag::{Tag, TagImportance, TagSignal};

/// Result of a conflict-aware insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id or fingerprint already exists
    Conflict,
}

/// Single-field mutations allowed on a stored article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleFlag {
    Saved(bool),
    ReadAt(DateTime<Utc>),
}

/// Which articles a projection query returns, and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionFilter {
    /// Never read, newest first
    Unread,
    /// Read at least once, most recently read first
    Read,
    /// Saved, newest first
    Saved,
    /// Belonging to one feed, newest first
    Feed(Uuid),
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn select_all(&self) -> Result<Vec<Article>>;

    async fn select_projections(&self, filter: ProjectionFilter) -> Result<Vec<ArticleProjection>>;

    async fn select_by_id(&self, id: Uuid) -> Result<Option<Article>>;

    /// One round trip regardless of how many ids are asked for. Result order
    /// is unspecified; unknown ids are simply absent.
    async fn select_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Article>>;

    async fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool>;

    async fn insert_if_absent(&self, article: &Article) -> Result<InsertOutcome>;

    /// Returns `false` when no article has this id.
    async fn update_flag(&self, id: Uuid, flag: ArticleFlag) -> Result<bool>;

    /// Deletes articles published before `cutoff`. Returns how many went.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, keep_saved: bool) -> Result<u64>;
}

#[async_trait]
pub trait TagStore: Send + Sync {
    /// All tag names, sorted.
    async fn tag_names(&self) -> Result<Vec<String>>;

    async fn list_tags(&self) -> Result<Vec<Tag>>;

    /// Batch join of article ids to their tags. Ids without tags may be
    /// missing from the map.
    async fn signals_for_articles(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<TagSignal>>>;

    async fn assign_tags(&self, article_id: Uuid, names: &[String]) -> Result<()>;

    /// Creates the tag if needed. `None` resets it to not important.
    async fn set_importance(&self, name: &str, importance: Option<TagImportance>) -> Result<()>;
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn all_feeds(&self) -> Result<Vec<Feed>>;

    async fn feed_by_id(&self, id: Uuid) -> Result<Option<Feed>>;

    /// Whether a feed other than `except` already uses `url`.
    async fn feed_url_exists(&self, url: &str, except: Option<Uuid>) -> Result<bool>;

    async fn insert_feed(&self, feed: &Feed) -> Result<()>;

    /// Writes name, url and `updated_at`. Returns `false` for an unknown id.
    async fn update_feed(&self, feed: &Feed) -> Result<bool>;

    async fn delete_feed(&self, id: Uuid) -> Result<bool>;

    async fn mark_feed_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct State {
        articles: Vec<Article>,
        tags: Vec<Tag>,
        article_tags: HashSet<(Uuid, Uuid)>,
        feeds: Vec<Feed>,
    }

    /// Test double for all store traits.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
        fail_reads: AtomicBool,
        fail_tag_lookups: AtomicBool,
        hide_fingerprints: AtomicBool,
        failing_links: Mutex<Option<String>>,
    }

    fn unavailable() -> Error {
        Error::Store(sqlx::Error::PoolTimedOut)
    }

    impl MemoryStore {
        pub fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_tag_lookups(&self, fail: bool) {
            self.fail_tag_lookups.store(fail, Ordering::SeqCst);
        }

        /// Makes the fingerprint check miss, as if a concurrent writer
        /// committed right after it.
        pub fn hide_fingerprints(&self, hide: bool) {
            self.hide_fingerprints.store(hide, Ordering::SeqCst);
        }

        /// Makes inserts fail for articles whose link starts with `prefix`.
        pub fn fail_inserts_for(&self, prefix: &str) {
            *self.failing_links.lock().unwrap() = Some(prefix.to_string());
        }

        pub fn article_count(&self) -> usize {
            self.state.lock().unwrap().articles.len()
        }

        pub fn articles(&self) -> Vec<Article> {
            self.state.lock().unwrap().articles.clone()
        }

        pub fn remove_article(&self, id: Uuid) {
            self.state.lock().unwrap().articles.retain(|a| a.id != id);
        }

        fn check_reads(&self) -> Result<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ArticleStore for MemoryStore {
        async fn select_all(&self) -> Result<Vec<Article>> {
            self.check_reads()?;
            Ok(self.articles())
        }

        async fn select_projections(&self, filter: ProjectionFilter) -> Result<Vec<ArticleProjection>> {
            self.check_reads()?;
            let state = self.state.lock().unwrap();
            let mut selected: Vec<&Article> = state
                .articles
                .iter()
                .filter(|a| match filter {
                    ProjectionFilter::Unread => a.last_read_at.is_none(),
                    ProjectionFilter::Read => a.last_read_at.is_some(),
                    ProjectionFilter::Saved => a.saved,
                    ProjectionFilter::Feed(feed_id) => a.feed_id == Some(feed_id),
                })
                .collect();
            match filter {
                ProjectionFilter::Read => selected.sort_by(|a, b| {
                    b.last_read_at.cmp(&a.last_read_at).then_with(|| b.id.cmp(&a.id))
                }),
                _ => selected.sort_by(|a, b| {
                    b.published_at.cmp(&a.published_at).then_with(|| b.id.cmp(&a.id))
                }),
            }
            Ok(selected.into_iter().map(ArticleProjection::from).collect())
        }

        async fn select_by_id(&self, id: Uuid) -> Result<Option<Article>> {
            self.check_reads()?;
            let state = self.state.lock().unwrap();
            Ok(state.articles.iter().find(|a| a.id == id).cloned())
        }

        async fn select_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Article>> {
            self.check_reads()?;
            let wanted: HashSet<&Uuid> = ids.iter().collect();
            let state = self.state.lock().unwrap();
            Ok(state
                .articles
                .iter()
                .filter(|a| wanted.contains(&a.id))
                .map(|a| (a.id, a.clone()))
                .collect())
        }

        async fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool> {
            if self.hide_fingerprints.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let state = self.state.lock().unwrap();
            Ok(state.articles.iter().any(|a| a.content_hash == fingerprint))
        }

        async fn insert_if_absent(&self, article: &Article) -> Result<InsertOutcome> {
            if let Some(prefix) = self.failing_links.lock().unwrap().as_deref() {
                if article.source_url.starts_with(prefix) {
                    return Err(unavailable());
                }
            }
            let mut state = self.state.lock().unwrap();
            let taken = state
                .articles
                .iter()
                .any(|a| a.id == article.id || a.content_hash == article.content_hash);
            if taken {
                return Ok(InsertOutcome::Conflict);
            }
            let mut stored = article.clone();
            stored.tags.clear();
            state.articles.push(stored);
            Ok(InsertOutcome::Inserted)
        }

        async fn update_flag(&self, id: Uuid, flag: ArticleFlag) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let Some(article) = state.articles.iter_mut().find(|a| a.id == id) else {
                return Ok(false);
            };
            match flag {
                ArticleFlag::Saved(saved) => article.saved = saved,
                ArticleFlag::ReadAt(at) => article.last_read_at = Some(at),
            }
            Ok(true)
        }

        async fn delete_older_than(&self, cutoff: DateTime<Utc>, keep_saved: bool) -> Result<u64> {
            let mut state = self.state.lock().unwrap();
            let before = state.articles.len();
            state
                .articles
                .retain(|a| a.published_at >= cutoff || (keep_saved && a.saved));
            Ok((before - state.articles.len()) as u64)
        }
    }

    #[async_trait]
    impl TagStore for MemoryStore {
        async fn tag_names(&self) -> Result<Vec<String>> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state.tags.iter().map(|t| t.name.clone()).collect();
            names.sort();
            Ok(names)
        }

        async fn list_tags(&self) -> Result<Vec<Tag>> {
            let state = self.state.lock().unwrap();
            let mut tags = state.tags.clone();
            tags.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(tags)
        }

        async fn signals_for_articles(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<TagSignal>>> {
            if self.fail_tag_lookups.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            let state = self.state.lock().unwrap();
            let mut signals: HashMap<Uuid, Vec<TagSignal>> = HashMap::new();
            for id in ids {
                for tag in &state.tags {
                    if state.article_tags.contains(&(*id, tag.id)) {
                        signals.entry(*id).or_default().push(TagSignal {
                            name: tag.name.clone(),
                            importance: tag.importance,
                        });
                    }
                }
            }
            Ok(signals)
        }

        async fn assign_tags(&self, article_id: Uuid, names: &[String]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for name in names {
                let existing = state.tags.iter().find(|t| &t.name == name).map(|t| t.id);
                let tag_id = match existing {
                    Some(id) => id,
                    None => {
                        let tag = Tag::new(name.clone());
                        let id = tag.id;
                        state.tags.push(tag);
                        id
                    }
                };
                state.article_tags.insert((article_id, tag_id));
            }
            Ok(())
        }

        async fn set_importance(&self, name: &str, importance: Option<TagImportance>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let importance = importance.unwrap_or_default();
            match state.tags.iter().position(|t| t.name == name) {
                Some(index) => state.tags[index].importance = importance,
                None => {
                    let mut tag = Tag::new(name.to_string());
                    tag.importance = importance;
                    state.tags.push(tag);
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FeedStore for MemoryStore {
        async fn all_feeds(&self) -> Result<Vec<Feed>> {
            self.check_reads()?;
            let state = self.state.lock().unwrap();
            let mut feeds = state.feeds.clone();
            feeds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(feeds)
        }

        async fn feed_by_id(&self, id: Uuid) -> Result<Option<Feed>> {
            let state = self.state.lock().unwrap();
            Ok(state.feeds.iter().find(|f| f.id == id).cloned())
        }

        async fn feed_url_exists(&self, url: &str, except: Option<Uuid>) -> Result<bool> {
            let state = self.state.lock().unwrap();
            Ok(state.feeds.iter().any(|f| f.url == url && Some(f.id) != except))
        }

        async fn insert_feed(&self, feed: &Feed) -> Result<()> {
            self.state.lock().unwrap().feeds.push(feed.clone());
            Ok(())
        }

        async fn update_feed(&self, feed: &Feed) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let Some(stored) = state.feeds.iter_mut().find(|f| f.id == feed.id) else {
                return Ok(false);
            };
            stored.name = feed.name.clone();
            stored.url = feed.url.clone();
            stored.updated_at = feed.updated_at;
            Ok(true)
        }

        async fn delete_feed(&self, id: Uuid) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let before = state.feeds.len();
            state.feeds.retain(|f| f.id != id);
            let removed = state.feeds.len() != before;
            if removed {
                for article in state.articles.iter_mut().filter(|a| a.feed_id == Some(id)) {
                    article.feed_id = None;
                }
            }
            Ok(removed)
        }

        async fn mark_feed_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let Some(feed) = state.feeds.iter_mut().find(|f| f.id == id) else {
                return Ok(false);
            };
            feed.last_read_at = Some(at);
            Ok(true)
        }
    }
}
