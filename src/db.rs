use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Article, ArticleProjection, Feed, Priority, SourceKind};
use crate::store::{ArticleFlag, ArticleStore, FeedStore, InsertOutcome, ProjectionFilter, TagStore};
use crate::tag::{Tag, TagImportance, TagSignal};

const ARTICLE_COLUMNS: &str = "id, title, description, content_hash, source_url, source_type, \
                               priority, published_at, last_read_at, saved, feed_id";

pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection that never
    /// expires, since every sqlite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                last_read_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                description_len INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT NOT NULL UNIQUE,
                source_url TEXT NOT NULL,
                source_type TEXT NOT NULL,
                priority INTEGER CHECK (priority BETWEEN 1 AND 5),
                published_at DATETIME NOT NULL,
                last_read_at DATETIME,
                saved INTEGER NOT NULL DEFAULT 0,
                feed_id TEXT REFERENCES feeds(id) ON DELETE SET NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles(published_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                high_importance INTEGER NOT NULL DEFAULT 0,
                weight INTEGER CHECK (weight >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS article_tags (
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (article_id, tag_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_error(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

fn uuid_column(row: &SqliteRow, column: &str) -> std::result::Result<Uuid, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| decode_error(column, format!("bad uuid {:?}: {}", raw, e)))
}

fn optional_uuid_column(row: &SqliteRow, column: &str) -> std::result::Result<Option<Uuid>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| Uuid::parse_str(&raw).map_err(|e| decode_error(column, format!("bad uuid {:?}: {}", raw, e))))
        .transpose()
}

/// Values outside the scale read back as unknown.
fn priority_column(row: &SqliteRow) -> std::result::Result<Option<Priority>, sqlx::Error> {
    let raw: Option<i64> = row.try_get("priority")?;
    Ok(raw.and_then(Priority::new))
}

fn importance_columns(row: &SqliteRow) -> std::result::Result<TagImportance, sqlx::Error> {
    let weight: Option<i64> = row.try_get("weight")?;
    match weight {
        Some(weight) => u32::try_from(weight)
            .map(TagImportance::Weight)
            .map_err(|_| decode_error("weight", format!("weight {} out of range", weight))),
        None => Ok(TagImportance::Flag(row.try_get("high_importance")?)),
    }
}

fn article_from_row(row: &SqliteRow) -> std::result::Result<Article, sqlx::Error> {
    let source_type: String = row.try_get("source_type")?;
    let source_kind = SourceKind::parse(&source_type)
        .ok_or_else(|| decode_error("source_type", format!("unknown source type {:?}", source_type)))?;

    Ok(Article {
        id: uuid_column(row, "id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        content_hash: row.try_get("content_hash")?,
        source_url: row.try_get("source_url")?,
        source_kind,
        priority: priority_column(row)?,
        tags: Vec::new(),
        published_at: row.try_get("published_at")?,
        last_read_at: row.try_get("last_read_at")?,
        saved: row.try_get("saved")?,
        feed_id: optional_uuid_column(row, "feed_id")?,
    })
}

fn feed_from_row(row: &SqliteRow) -> std::result::Result<Feed, sqlx::Error> {
    Ok(Feed {
        id: uuid_column(row, "id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_read_at: row.try_get("last_read_at")?,
    })
}

/// JSON array of ids, expanded server side with `json_each` so any number
/// of ids binds as a single parameter.
fn id_list(ids: &[Uuid]) -> String {
    let ids: Vec<serde_json::Value> = ids.iter().map(|id| id.to_string().into()).collect();
    serde_json::Value::Array(ids).to_string()
}

#[async_trait]
impl ArticleStore for Database {
    async fn select_all(&self) -> Result<Vec<Article>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM articles ORDER BY published_at DESC, id DESC",
            ARTICLE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(article_from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn select_projections(&self, filter: ProjectionFilter) -> Result<Vec<ArticleProjection>> {
        let (condition, order) = match filter {
            ProjectionFilter::Unread => ("last_read_at IS NULL", "published_at DESC, id DESC"),
            ProjectionFilter::Read => ("last_read_at IS NOT NULL", "last_read_at DESC, id DESC"),
            ProjectionFilter::Saved => ("saved = 1", "published_at DESC, id DESC"),
            ProjectionFilter::Feed(_) => ("feed_id = ?", "published_at DESC, id DESC"),
        };
        let sql = format!(
            r#"
            SELECT id, published_at, priority, description_len
            FROM articles
            WHERE {}
            ORDER BY {}
            "#,
            condition, order
        );

        let mut query = sqlx::query(&sql);
        if let ProjectionFilter::Feed(feed_id) = filter {
            query = query.bind(feed_id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let projections = rows
            .iter()
            .map(|row| -> std::result::Result<ArticleProjection, sqlx::Error> {
                let len: i64 = row.try_get("description_len")?;
                Ok(ArticleProjection {
                    id: uuid_column(row, "id")?,
                    published_at: row.try_get("published_at")?,
                    priority: priority_column(row)?,
                    description_len: len.max(0) as usize,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        Ok(projections)
    }

    async fn select_by_id(&self, id: Uuid) -> Result<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {} FROM articles WHERE id = ?", ARTICLE_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn select_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Article>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT {} FROM articles WHERE id IN (SELECT value FROM json_each(?))",
            ARTICLE_COLUMNS
        ))
        .bind(id_list(ids))
        .fetch_all(&self.pool)
        .await?;

        let mut articles = HashMap::with_capacity(rows.len());
        for row in &rows {
            let article = article_from_row(row)?;
            articles.insert(article.id, article);
        }
        Ok(articles)
    }

    async fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM articles WHERE content_hash = ?)")
            .bind(fingerprint)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert_if_absent(&self, article: &Article) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (id, title, description, description_len, content_hash, source_url,
                                  source_type, priority, published_at, last_read_at, saved, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article.id.to_string())
        .bind(&article.title)
        .bind(&article.description)
        .bind(article.description_len() as i64)
        .bind(&article.content_hash)
        .bind(&article.source_url)
        .bind(article.source_kind.as_str())
        .bind(article.priority.map(i64::from))
        .bind(article.published_at)
        .bind(article.last_read_at)
        .bind(article.saved)
        .bind(article.feed_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_flag(&self, id: Uuid, flag: ArticleFlag) -> Result<bool> {
        let query = match flag {
            ArticleFlag::Saved(saved) => sqlx::query("UPDATE articles SET saved = ? WHERE id = ?").bind(saved),
            ArticleFlag::ReadAt(at) => sqlx::query("UPDATE articles SET last_read_at = ? WHERE id = ?").bind(at),
        };
        let result = query.bind(id.to_string()).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, keep_saved: bool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM articles
            WHERE published_at < ?
              AND (? = 0 OR saved = 0)
            "#,
        )
        .bind(cutoff)
        .bind(keep_saved)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TagStore for Database {
    async fn tag_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn list_tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name, high_importance, weight FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let tags = rows
            .iter()
            .map(|row| -> std::result::Result<Tag, sqlx::Error> {
                Ok(Tag {
                    id: uuid_column(row, "id")?,
                    name: row.try_get("name")?,
                    importance: importance_columns(row)?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        Ok(tags)
    }

    async fn signals_for_articles(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<TagSignal>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT link.article_id, tags.name, tags.high_importance, tags.weight
            FROM article_tags link
            JOIN tags ON tags.id = link.tag_id
            WHERE link.article_id IN (SELECT value FROM json_each(?))
            ORDER BY link.article_id, tags.name
            "#,
        )
        .bind(id_list(ids))
        .fetch_all(&self.pool)
        .await?;

        let mut signals: HashMap<Uuid, Vec<TagSignal>> = HashMap::new();
        for row in &rows {
            let article_id = uuid_column(row, "article_id")?;
            signals.entry(article_id).or_default().push(TagSignal {
                name: row.try_get("name")?,
                importance: importance_columns(row)?,
            });
        }
        Ok(signals)
    }

    async fn assign_tags(&self, article_id: Uuid, names: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            let tag = Tag::new(name.clone());
            sqlx::query("INSERT INTO tags (id, name) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
                .bind(tag.id.to_string())
                .bind(&tag.name)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO article_tags (article_id, tag_id)
                SELECT ?, id FROM tags WHERE name = ?
                "#,
            )
            .bind(article_id.to_string())
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_importance(&self, name: &str, importance: Option<TagImportance>) -> Result<()> {
        let (high, weight) = match importance {
            Some(TagImportance::Flag(high)) => (high, None),
            Some(TagImportance::Weight(weight)) => (false, Some(weight as i64)),
            None => (false, None),
        };

        sqlx::query(
            r#"
            INSERT INTO tags (id, name, high_importance, weight)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                high_importance = excluded.high_importance,
                weight = excluded.weight
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(high)
        .bind(weight)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FeedStore for Database {
    async fn all_feeds(&self) -> Result<Vec<Feed>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, url, created_at, updated_at, last_read_at FROM feeds
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(feed_from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn feed_by_id(&self, id: Uuid) -> Result<Option<Feed>> {
        let row = sqlx::query("SELECT id, name, url, created_at, updated_at, last_read_at FROM feeds WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(feed_from_row).transpose()?)
    }

    async fn feed_url_exists(&self, url: &str, except: Option<Uuid>) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM feeds WHERE url = ? AND id IS NOT ?)")
            .bind(url)
            .bind(except.map(|id| id.to_string()))
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert_feed(&self, feed: &Feed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feeds (id, name, url, created_at, updated_at, last_read_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(feed.id.to_string())
        .bind(&feed.name)
        .bind(&feed.url)
        .bind(feed.created_at)
        .bind(feed.updated_at)
        .bind(feed.last_read_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_feed(&self, feed: &Feed) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET name = ?, url = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&feed.name)
        .bind(&feed.url)
        .bind(feed.updated_at)
        .bind(feed.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_feed(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_feed_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_read_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
