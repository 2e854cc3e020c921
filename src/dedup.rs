use std::fmt;
use std::sync::Arc;

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::Article;
use crate::store::{ArticleStore, InsertOutcome};

/// Hex SHA-256 over title, description and link, in that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(title: &str, description: &str, link: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(description.as_bytes());
        hasher.update(link.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keeps re-fetched content out of the article table.
pub struct Deduplicator {
    store: Arc<dyn ArticleStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        Self { store }
    }

    pub async fn is_duplicate(&self, fingerprint: &str) -> Result<bool> {
        self.store.fingerprint_exists(fingerprint).await
    }

    /// Stores `article` unless its fingerprint is already known.
    ///
    /// The existence check and the insert are separate round trips, so two
    /// concurrent ingestions of the same content can both pass the check.
    /// The store's uniqueness constraint on the fingerprint catches the
    /// loser, which is reported as [`Error::DuplicateContent`] as well.
    pub async fn save(&self, article: &Article) -> Result<()> {
        if self.is_duplicate(&article.content_hash).await? {
            return Err(Error::DuplicateContent(article.content_hash.clone()));
        }

        match self.store.insert_if_absent(article).await? {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Conflict => {
                debug!(
                    "Insert of {} lost a race on fingerprint {}",
                    article.id, article.content_hash
                );
                Err(Error::DuplicateContent(article.content_hash.clone()))
            }
        }
    }
}
