use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::Fingerprint;

/// Where an article came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Pulled from a syndication feed
    Rss,
    /// Scraped by hand from a page without a feed
    Scraped,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::Scraped => "scraped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rss" => Some(SourceKind::Rss),
            "scraped" => Some(SourceKind::Scraped),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Editorial priority on a 1..=5 scale, 1 being the most important.
/// Anything outside the scale is "unknown" and is carried as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 5;

    pub fn new(value: i64) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Some(Self(value as u8))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Priority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Priority::new(value).ok_or_else(|| format!("priority {} outside 1..=5", value))
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        priority.0 as i64
    }
}

/// A single entry as returned by a source, before it becomes an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub description: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(skip)]
    pub content_hash: String,
    pub source_url: String,
    pub source_kind: SourceKind,
    pub priority: Option<Priority>,
    /// Tag names, always rendered sorted
    pub tags: Vec<String>,
    pub published_at: DateTime<Utc>,
    /// `None` until the article has been opened once
    pub last_read_at: Option<DateTime<Utc>>,
    pub saved: bool,
    pub feed_id: Option<Uuid>,
}

impl Article {
    /// Builds a fresh, unread article from a fetched item.
    pub fn from_item(item: FeedItem, feed_id: Option<Uuid>) -> Self {
        let fingerprint = Fingerprint::of(&item.title, &item.description, &item.link);
        Self {
            id: Uuid::new_v4(),
            title: item.title,
            description: item.description,
            content_hash: fingerprint.into_string(),
            source_url: item.link,
            source_kind: SourceKind::Rss,
            priority: None,
            tags: Vec::new(),
            published_at: item.published_at,
            last_read_at: None,
            saved: false,
            feed_id,
        }
    }

    /// Length of the trimmed description in characters. Computed once at
    /// insert so every store ranks on the same number.
    pub fn description_len(&self) -> usize {
        self.description.trim().chars().count()
    }
}

/// Narrow read model used to order candidates without loading bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleProjection {
    pub id: Uuid,
    pub published_at: DateTime<Utc>,
    pub priority: Option<Priority>,
    /// Length of the trimmed description, in characters
    pub description_len: usize,
}

impl From<&Article> for ArticleProjection {
    fn from(article: &Article) -> Self {
        Self {
            id: article.id,
            published_at: article.published_at,
            priority: article.priority,
            description_len: article.description_len(),
        }
    }
}

/// A registered syndication source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Feed {
    pub fn new(name: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            url: url.trim().to_string(),
            created_at: now,
            updated_at: now,
            last_read_at: None,
        }
    }
}
