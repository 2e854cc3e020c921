use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::TagStore;

/// Anything that can push an article up the ranking.
pub trait Importance {
    fn contribution(&self) -> f64;
}

/// How much a tag matters to the reader.
///
/// Older rows only carry a high-importance flag, newer ones a weight; the
/// ranking only ever sees [`Importance::contribution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TagImportance {
    Flag(bool),
    Weight(u32),
}

impl Default for TagImportance {
    fn default() -> Self {
        TagImportance::Flag(false)
    }
}

impl Importance for TagImportance {
    fn contribution(&self) -> f64 {
        match self {
            TagImportance::Flag(true) => 1.0,
            TagImportance::Flag(false) => 0.0,
            TagImportance::Weight(weight) => *weight as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub importance: TagImportance,
}

impl Tag {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            importance: TagImportance::default(),
        }
    }
}

/// One tag association of an article, as seen by the ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSignal {
    pub name: String,
    pub importance: TagImportance,
}

impl Importance for TagSignal {
    fn contribution(&self) -> f64 {
        self.importance.contribution()
    }
}

/// Article id to its tag associations.
pub type TagSignals = HashMap<Uuid, Vec<TagSignal>>;

/// Summed importance of a set of tag associations.
pub fn importance_contribution<I: Importance>(signals: &[I]) -> f64 {
    signals.iter().map(Importance::contribution).sum()
}

/// Sorted tag names of one article.
pub fn sorted_names(signals: Option<&Vec<TagSignal>>) -> Vec<String> {
    let mut names: Vec<String> = signals
        .map(|signals| signals.iter().map(|s| s.name.clone()).collect())
        .unwrap_or_default();
    names.sort();
    names.dedup();
    names
}

/// Trims names, drops empties and duplicates.
pub fn normalize_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct TagService {
    store: Arc<dyn TagStore>,
}

impl TagService {
    pub fn new(store: Arc<dyn TagStore>) -> Self {
        Self { store }
    }

    /// Batch lookup of tag signals for `ids`, one round trip.
    ///
    /// Never fails: a broken lookup ranks everything with zero importance.
    pub async fn importance(&self, ids: &[Uuid]) -> TagSignals {
        if ids.is_empty() {
            return TagSignals::new();
        }

        match self.store.signals_for_articles(ids).await {
            Ok(mut signals) => {
                for id in ids {
                    signals.entry(*id).or_default();
                }
                debug!("Resolved tag signals for {} articles", ids.len());
                signals
            }
            Err(e) => {
                warn!(
                    "Tag lookup for {} articles failed, ranking without tags: {}",
                    ids.len(),
                    e
                );
                TagSignals::new()
            }
        }
    }

    pub async fn known_names(&self) -> Result<Vec<String>> {
        self.store.tag_names().await
    }

    /// Links `names` to an article, creating tags that do not exist yet.
    pub async fn assign(&self, article_id: Uuid, names: &[String]) -> Result<()> {
        let names = normalize_names(names);
        if names.is_empty() {
            return Ok(());
        }
        self.store.assign_tags(article_id, &names).await
    }

    pub async fn list(&self) -> Result<Vec<Tag>> {
        self.store.list_tags().await
    }

    pub async fn set_weight(&self, name: &str, weight: i64) -> Result<()> {
        let name = Self::valid_name(name)?;
        let weight = u32::try_from(weight)
            .map_err(|_| Error::Validation(format!("invalid weight {} for tag {:?}", weight, name)))?;
        self.store
            .set_importance(name, Some(TagImportance::Weight(weight)))
            .await
    }

    pub async fn set_flag(&self, name: &str, high: bool) -> Result<()> {
        let name = Self::valid_name(name)?;
        self.store
            .set_importance(name, Some(TagImportance::Flag(high)))
            .await
    }

    pub async fn clear(&self, name: &str) -> Result<()> {
        let name = Self::valid_name(name)?;
        self.store.set_importance(name, None).await
    }

    fn valid_name(name: &str) -> Result<&str> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("tag name cannot be empty".to_string()));
        }
        Ok(name)
    }
}
