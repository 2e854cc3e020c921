use std::ops::Range;

use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Article, ArticleProjection};
use crate::store::ArticleStore;
use crate::tag::{sorted_names, TagSignals};

/// What to do with a window that does not fit the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsPolicy {
    /// Fall back to the whole list
    #[default]
    Clamp,
    /// Reject with a validation error
    Strict,
}

/// Half-open `[from, to)` slice of an ordered list, as requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub from: i64,
    pub to: i64,
}

impl Window {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// The part of validation that does not need the list length, so a
    /// strict caller can be turned away before touching the store.
    pub fn precheck(&self, policy: BoundsPolicy) -> Result<()> {
        if policy == BoundsPolicy::Strict && (self.from < 0 || self.from >= self.to) {
            return Err(self.invalid(None));
        }
        Ok(())
    }

    pub fn resolve(&self, len: usize, policy: BoundsPolicy) -> Result<Range<usize>> {
        if len == 0 {
            return Ok(0..0);
        }
        let fits = self.from >= 0 && self.from < self.to && self.to <= len as i64;
        if fits {
            return Ok(self.from as usize..self.to as usize);
        }
        match policy {
            BoundsPolicy::Clamp => {
                debug!("Window {}..{} clamped to 0..{}", self.from, self.to, len);
                Ok(0..len)
            }
            BoundsPolicy::Strict => Err(self.invalid(Some(len))),
        }
    }

    fn invalid(&self, len: Option<usize>) -> Error {
        match len {
            Some(len) => Error::Validation(format!(
                "window {}..{} does not fit {} items",
                self.from, self.to, len
            )),
            None => Error::Validation(format!("window {}..{} is empty or negative", self.from, self.to)),
        }
    }
}

/// Slices `window` out of `ordered` and hydrates just that slice.
pub async fn page(
    store: &dyn ArticleStore,
    ordered: &[ArticleProjection],
    window: Window,
    policy: BoundsPolicy,
    signals: &TagSignals,
) -> Result<Vec<Article>> {
    let range = window.resolve(ordered.len(), policy)?;
    let ids: Vec<Uuid> = ordered[range].iter().map(|p| p.id).collect();
    hydrate(store, &ids, signals).await
}

/// Expands `ids` into full articles with one batched fetch, keeping the
/// order of `ids`. Ids that vanished from the store are skipped.
pub async fn hydrate(store: &dyn ArticleStore, ids: &[Uuid], signals: &TagSignals) -> Result<Vec<Article>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut fetched = store.select_by_ids(ids).await?;
    let mut articles = Vec::with_capacity(ids.len());
    for id in ids {
        match fetched.remove(id) {
            Some(mut article) => {
                article.tags = sorted_names(signals.get(id));
                articles.push(article);
            }
            None => debug!("Article {} disappeared before hydration", id),
        }
    }
    Ok(articles)
}
