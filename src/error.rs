use thiserror::Error;

use crate::feed::FetchError;

#[derive(Error, Debug)]
pub enum Error {
    /// The fingerprint is already stored. Expected during ingestion.
    #[error("duplicate content: {0}")]
    DuplicateContent(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("failed to fetch source {url}: {source}")]
    SourceFetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("enrichment degraded: {0}")]
    EnrichmentDegraded(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateContent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
