use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use feed_rs::parser::{self, ParseFeedError};
use log::{debug, info};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SourceSettings;
use crate::error::{Error, Result};
use crate::models::{Feed, FeedItem};
use crate::store::FeedStore;

const USER_AGENT: &str = concat!("tagfeed/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(StatusCode),

    #[error("not a syndication document: {0}")]
    Parse(#[from] ParseFeedError),

    #[error("feed has no title")]
    Untitled,

    #[error("feed has no entries")]
    Empty,

    #[error("entry {0:?} has no publication date")]
    MissingDate(String),

    #[error("entry {0:?} has no link")]
    MissingLink(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// Source Fetcher: turns a feed url into publishable items.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, deadline: Duration) -> std::result::Result<Vec<FeedItem>, FetchError>;

    /// Pass/fail check that `url` serves a usable feed.
    async fn validate(&self, url: &str, deadline: Duration) -> std::result::Result<(), FetchError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> std::result::Result<Self, FetchError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str, deadline: Duration) -> std::result::Result<feed_rs::model::Feed, FetchError> {
        let response = self.client.get(url).timeout(deadline).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(deadline)
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let bytes = response.bytes().await?;
        Ok(parser::parse(&bytes[..])?)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, deadline: Duration) -> std::result::Result<Vec<FeedItem>, FetchError> {
        let feed = self.download(url, deadline).await?;
        let items = items_from_feed(feed)?;
        debug!("Fetched {} items from {}", items.len(), url);
        Ok(items)
    }

    async fn validate(&self, url: &str, deadline: Duration) -> std::result::Result<(), FetchError> {
        let feed = self.download(url, deadline).await?;
        let titled = feed.title.map(|t| !t.content.trim().is_empty()).unwrap_or(false);
        if !titled {
            return Err(FetchError::Untitled);
        }
        Ok(())
    }
}

/// Maps parsed entries to items. Atom entries without `published` fall
/// back to `updated`; an entry with neither fails the whole source.
pub fn items_from_feed(feed: feed_rs::model::Feed) -> std::result::Result<Vec<FeedItem>, FetchError> {
    if feed.entries.is_empty() {
        return Err(FetchError::Empty);
    }

    feed.entries
        .into_iter()
        .map(|entry| {
            let title = entry.title.map(|t| t.content).unwrap_or_default();
            let description = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .ok_or_else(|| FetchError::MissingLink(title.clone()))?;
            let published_at = entry
                .published
                .or(entry.updated)
                .ok_or_else(|| FetchError::MissingDate(title.clone()))?;

            Ok(FeedItem {
                title,
                description,
                link,
                published_at,
            })
        })
        .collect()
}

/// Registry of the sources the scheduler walks.
pub struct FeedManager {
    store: Arc<dyn FeedStore>,
    fetcher: Arc<dyn SourceFetcher>,
    deadline: Duration,
}

impl FeedManager {
    pub fn new(store: Arc<dyn FeedStore>, fetcher: Arc<dyn SourceFetcher>, deadline: Duration) -> Self {
        Self {
            store,
            fetcher,
            deadline,
        }
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        self.store.all_feeds().await
    }

    pub async fn get_feed(&self, id: Uuid) -> Result<Feed> {
        self.store
            .feed_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("feed", id))
    }

    /// Registers a feed after checking the url and the document behind it.
    pub async fn add_feed(&self, name: &str, url: &str) -> Result<Feed> {
        let url = self.checked_source(name, url, None).await?;
        let feed = Feed::new(name, &url);
        self.store.insert_feed(&feed).await?;
        info!("Added feed {} ({})", feed.name, feed.url);
        Ok(feed)
    }

    /// Renames and/or repoints a feed, with the same checks as
    /// [`FeedManager::add_feed`].
    pub async fn update_feed(&self, id: Uuid, name: &str, url: &str) -> Result<Feed> {
        if id.is_nil() {
            return Err(Error::Validation("feed id must not be nil".to_string()));
        }
        let mut feed = self.get_feed(id).await?;
        let url = self.checked_source(name, url, Some(id)).await?;

        feed.name = name.trim().to_string();
        feed.url = url;
        feed.updated_at = Utc::now();
        if !self.store.update_feed(&feed).await? {
            return Err(Error::not_found("feed", id));
        }
        info!("Updated feed {} ({})", feed.name, feed.url);
        Ok(feed)
    }

    /// Validates name and url, checks the source serves a feed and that no
    /// other feed (besides `except`) uses the url. Returns the trimmed url.
    async fn checked_source(&self, name: &str, url: &str, except: Option<Uuid>) -> Result<String> {
        let url = validate_feed_url(url)?;
        if name.trim().is_empty() {
            return Err(Error::Validation("feed name cannot be empty".to_string()));
        }

        self.fetcher
            .validate(&url, self.deadline)
            .await
            .map_err(|source| Error::SourceFetch {
                url: url.clone(),
                source,
            })?;

        if self.store.feed_url_exists(&url, except).await? {
            return Err(Error::Validation(format!("feed url {} is already registered", url)));
        }
        Ok(url)
    }

    /// Registers configured sources that are not known yet, without
    /// hitting the network.
    pub async fn seed(&self, sources: &[SourceSettings]) -> Result<usize> {
        let mut added = 0;
        for source in sources {
            let url = validate_feed_url(&source.url)?;
            if self.store.feed_url_exists(&url, None).await? {
                continue;
            }
            let name = if source.name.trim().is_empty() { &url } else { &source.name };
            self.store.insert_feed(&Feed::new(name, &url)).await?;
            added += 1;
        }
        if added > 0 {
            info!("Seeded {} feeds from configuration", added);
        }
        Ok(added)
    }

    pub async fn remove_feed(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_feed(id).await? {
            return Err(Error::not_found("feed", id));
        }
        info!("Removed feed {}", id);
        Ok(())
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<()> {
        if !self.store.mark_feed_read(id, Utc::now()).await? {
            return Err(Error::not_found("feed", id));
        }
        Ok(())
    }
}

/// Accepts absolute http(s) urls with a host, returns them trimmed.
pub fn validate_feed_url(url: &str) -> Result<String> {
    let url = url.trim();
    let parsed = Url::parse(url).map_err(|e| Error::Validation(format!("invalid feed url {:?}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::Validation(format!("feed url {:?} must be http(s) with a host", url)));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example News</title>
    <link>https://example.com</link>
    <description>Example</description>
    <item>
      <title>First story</title>
      <link>https://example.com/first</link>
      <description>Something happened.</description>
      <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second story</title>
      <link>https://example.com/second</link>
      <description>Something else happened.</description>
      <pubDate>Mon, 06 Jan 2025 09:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    const RSS_WITHOUT_DATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Undated</title>
    <link>https://example.com</link>
    <description>Example</description>
    <item>
      <title>Timeless</title>
      <link>https://example.com/timeless</link>
      <description>No date here.</description>
    </item>
  </channel>
</rss>"#;

    async fn serve(body: &'static str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn feed_urls_must_be_http_with_host() {
        assert_eq!(
            validate_feed_url(" https://example.com/rss ").unwrap(),
            "https://example.com/rss"
        );
        assert!(validate_feed_url("ftp://example.com/rss").is_err());
        assert!(validate_feed_url("not a url").is_err());
        assert!(validate_feed_url("").is_err());
    }

    #[tokio::test]
    async fn fetch_reads_items_in_document_order() {
        let server = serve(RSS).await;
        let fetcher = HttpFetcher::new().unwrap();

        let items = fetcher
            .fetch(&format!("{}/rss.xml", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First story");
        assert_eq!(items[0].link, "https://example.com/first");
        assert_eq!(items[0].description, "Something happened.");
        assert!(items[0].published_at > items[1].published_at);
    }

    #[tokio::test]
    async fn missing_publication_date_fails_the_source() {
        let server = serve(RSS_WITHOUT_DATE).await;
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("{}/rss.xml", server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingDate(title) if title == "Timeless"));
    }

    #[tokio::test]
    async fn error_status_fails_the_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("{}/rss.xml", server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(status) if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("{}/rss.xml", server.uri()), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn add_feed_validates_and_rejects_repeats() {
        let server = serve(RSS).await;
        let store = Arc::new(MemoryStore::default());
        let manager = FeedManager::new(
            store.clone(),
            Arc::new(HttpFetcher::new().unwrap()),
            Duration::from_secs(5),
        );
        let url = format!("{}/rss.xml", server.uri());

        let feed = manager.add_feed("Example", &url).await.unwrap();
        assert_eq!(manager.get_feeds().await.unwrap(), vec![feed.clone()]);

        let again = manager.add_feed("Example again", &url).await;
        assert!(matches!(again, Err(Error::Validation(_))));

        manager.mark_read(feed.id).await.unwrap();
        assert!(manager.get_feed(feed.id).await.unwrap().last_read_at.is_some());

        manager.remove_feed(feed.id).await.unwrap();
        assert!(matches!(
            manager.remove_feed(feed.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_feed_checks_url_against_other_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::default());
        let manager = FeedManager::new(
            store.clone(),
            Arc::new(HttpFetcher::new().unwrap()),
            Duration::from_secs(5),
        );
        let first_url = format!("{}/first.xml", server.uri());
        let second_url = format!("{}/second.xml", server.uri());
        let first = manager.add_feed("First", &first_url).await.unwrap();
        let second = manager.add_feed("Second", &second_url).await.unwrap();

        // Keeping its own url is fine.
        let renamed = manager.update_feed(first.id, " Renamed ", &first_url).await.unwrap();
        assert_eq!(renamed.name, "Renamed");
        assert!(renamed.updated_at >= first.updated_at);
        assert_eq!(manager.get_feed(first.id).await.unwrap().name, "Renamed");

        let taken = manager.update_feed(second.id, "Second", &first_url).await;
        assert!(matches!(taken, Err(Error::Validation(_))));

        let moved_url = format!("{}/moved.xml", server.uri());
        let moved = manager.update_feed(second.id, "Second", &moved_url).await.unwrap();
        assert_eq!(manager.get_feed(second.id).await.unwrap().url, moved.url);

        assert!(matches!(
            manager.update_feed(Uuid::new_v4(), "Ghost", &moved_url).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            manager.update_feed(Uuid::nil(), "Ghost", &moved_url).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_feed_rejects_a_broken_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::default());
        let manager = FeedManager::new(
            store.clone(),
            Arc::new(HttpFetcher::new().unwrap()),
            Duration::from_secs(5),
        );
        let feed = manager
            .add_feed("Example", &format!("{}/rss.xml", server.uri()))
            .await
            .unwrap();

        let err = manager
            .update_feed(feed.id, "Example", &format!("{}/gone.xml", server.uri()))
            .await;
        assert!(matches!(err, Err(Error::SourceFetch { .. })));
        assert_eq!(manager.get_feed(feed.id).await.unwrap().url, feed.url);
    }

    #[tokio::test]
    async fn seeding_skips_known_urls() {
        let store = Arc::new(MemoryStore::default());
        let manager = FeedManager::new(
            store.clone(),
            Arc::new(HttpFetcher::new().unwrap()),
            Duration::from_secs(5),
        );
        let sources = vec![
            SourceSettings {
                name: "One".to_string(),
                url: "https://one.example/rss".to_string(),
            },
            SourceSettings {
                name: "Two".to_string(),
                url: "https://two.example/rss".to_string(),
            },
        ];

        assert_eq!(manager.seed(&sources).await.unwrap(), 2);
        assert_eq!(manager.seed(&sources).await.unwrap(), 0);
        assert_eq!(manager.get_feeds().await.unwrap().len(), 2);
    }
}
