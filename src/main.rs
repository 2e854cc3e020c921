use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;
use uuid::Uuid;

mod config;
mod db;
mod dedup;
mod enrichment;
mod error;
mod feed;
mod logger;
mod models;
mod pagination;
mod ranking;
mod scheduler;
mod service;
mod store;
mod tag;

use config::{Config, DEFAULT_CONFIG_PATH};
use enrichment::{ChatEnricher, DisabledEnricher, Enricher};
use feed::{FeedManager, HttpFetcher, SourceFetcher};
use ranking::RankingEngine;
use scheduler::Scheduler;
use service::{ArticleService, RetentionPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "TAGFEED_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Database url, overrides `database.url`
    #[arg(long, env = "DATABASE_URL", global = true)]
    database: Option<String>,

    /// Console log level, overrides `log.console_level`
    #[arg(long, env = "TAGFEED_LOG", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest on a timer and sweep old articles until Ctrl-C
    Serve,
    /// Run one ingestion cycle now
    Refresh {
        /// Only this feed
        #[arg(long)]
        feed: Option<Uuid>,
    },
    /// Run the retention sweep now
    Sweep,
    #[command(subcommand)]
    Feed(FeedCommand),
    #[command(subcommand)]
    Articles(ArticlesCommand),
    MarkSaved {
        id: Uuid,
        /// Clear the flag instead of setting it
        #[arg(long)]
        unset: bool,
    },
    MarkRead {
        id: Uuid,
    },
    #[command(subcommand)]
    Tags(TagsCommand),
}

#[derive(Subcommand, Debug)]
enum FeedCommand {
    Add { name: String, url: String },
    /// Rename a feed or point it at a new url
    Update { id: Uuid, name: String, url: String },
    List,
    Remove { id: Uuid },
    Read { id: Uuid },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct WindowArgs {
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    from: i64,
    #[arg(long, default_value_t = 20, allow_hyphen_values = true)]
    to: i64,
}

#[derive(Subcommand, Debug)]
enum ArticlesCommand {
    /// Ranked unread articles
    Feed(WindowArgs),
    /// Read articles, latest read first
    History(WindowArgs),
    Saved(WindowArgs),
    ByFeed {
        feed: Uuid,
        #[command(flatten)]
        window: WindowArgs,
    },
    Show { id: Uuid },
    All,
}

#[derive(Subcommand, Debug)]
enum TagsCommand {
    List,
    Weight {
        name: String,
        #[arg(allow_hyphen_values = true)]
        weight: i64,
    },
    Flag {
        name: String,
        /// Mark as not important
        #[arg(long)]
        off: bool,
    },
    Clear { name: String },
}

struct App {
    config: Config,
    feeds: FeedManager,
    articles: Arc<ArticleService>,
    scheduler: Scheduler,
}

impl App {
    async fn build(config: Config) -> Result<Self> {
        let db = Arc::new(
            db::Database::new(&config.database.url)
                .await
                .with_context(|| format!("cannot open database {}", config.database.url))?,
        );
        let fetcher: Arc<dyn SourceFetcher> = Arc::new(HttpFetcher::new()?);
        let enricher: Arc<dyn Enricher> = if config.enrichment.enabled {
            info!("Enrichment via {} ({})", config.enrichment.base_url, config.enrichment.model);
            Arc::new(ChatEnricher::new(&config.enrichment)?)
        } else {
            Arc::new(DisabledEnricher)
        };

        let ranking = RankingEngine::new(
            config.ranking.policy,
            config.ranking.half_life_hours,
            config.ranking.block_hours,
        );
        let retention = RetentionPolicy {
            max_age: chrono::Duration::hours(config.retention.max_age_hours),
            keep_saved: config.retention.keep_saved,
        };
        let articles = Arc::new(
            ArticleService::new(db.clone(), db.clone(), enricher)
                .with_ranking(ranking)
                .with_bounds(config.pagination.bounds)
                .with_retention(retention),
        );

        let feeds = FeedManager::new(db.clone(), fetcher.clone(), config.scheduler.fetch_timeout());
        let scheduler = Scheduler::new(
            db,
            fetcher,
            articles.clone(),
            config.scheduler.clone(),
            config.retention.interval(),
        );

        Ok(Self {
            config,
            feeds,
            articles,
            scheduler,
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(url) = args.database {
        config.database.url = url;
    }
    logger::init(logger::LogConfig::from_settings(&config.log, args.log_level.as_deref()))?;
    match &config.origin {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("Config file {} not found, using defaults", args.config.display()),
    }

    let app = App::build(config).await?;

    match args.command {
        Command::Serve => {
            app.feeds.seed(&app.config.sources).await?;
            app.scheduler
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Cannot listen for Ctrl-C: {}", e);
                    }
                })
                .await;
        }
        Command::Refresh { feed } => {
            let report = match feed {
                Some(id) => app.scheduler.refresh_feed(id).await?,
                None => app.scheduler.run_ingestion_cycle().await?,
            };
            print_json(&report)?;
        }
        Command::Sweep => {
            let deleted = app.scheduler.run_retention_sweep().await?;
            println!("Deleted {} articles", deleted);
        }
        Command::Feed(command) => match command {
            FeedCommand::Add { name, url } => {
                let feed = app.feeds.add_feed(&name, &url).await?;
                info!("Feed added: {} ({})", feed.id, feed.url);
                print_json(&app.scheduler.refresh_feed(feed.id).await?)?;
            }
            FeedCommand::Update { id, name, url } => {
                let feed = app.feeds.update_feed(id, &name, &url).await?;
                info!("Feed updated: {} ({})", feed.id, feed.url);
                print_json(&app.scheduler.refresh_feed(feed.id).await?)?;
            }
            FeedCommand::List => {
                for feed in app.feeds.get_feeds().await? {
                    let last_read = feed
                        .last_read_at
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!("ID: {}, Name: {}, URL: {}, Read: {}", feed.id, feed.name, feed.url, last_read);
                }
            }
            FeedCommand::Remove { id } => {
                app.feeds.remove_feed(id).await?;
                println!("Feed removed");
            }
            FeedCommand::Read { id } => {
                app.feeds.mark_read(id).await?;
                print_json(&app.feeds.get_feed(id).await?)?;
            }
        },
        Command::Articles(command) => {
            let articles = match command {
                ArticlesCommand::Feed(w) => app.articles.get_ranked_page(w.from, w.to).await?,
                ArticlesCommand::History(w) => app.articles.get_history_page(w.from, w.to).await?,
                ArticlesCommand::Saved(w) => app.articles.get_saved_page(w.from, w.to).await?,
                ArticlesCommand::ByFeed { feed, window } => {
                    app.articles.get_feed_page(feed, window.from, window.to).await?
                }
                ArticlesCommand::Show { id } => vec![app.articles.get_article(id).await?],
                ArticlesCommand::All => app.articles.get_all().await?,
            };
            print_json(&articles)?;
        }
        Command::MarkSaved { id, unset } => {
            app.articles.mark_saved(id, !unset).await?;
        }
        Command::MarkRead { id } => {
            app.articles.mark_read(id).await?;
        }
        Command::Tags(command) => match command {
            TagsCommand::List => {
                for tag in app.articles.tags().list().await? {
                    println!("{}: {:?}", tag.name, tag.importance);
                }
            }
            TagsCommand::Weight { name, weight } => app.articles.tags().set_weight(&name, weight).await?,
            TagsCommand::Flag { name, off } => app.articles.tags().set_flag(&name, !off).await?,
            TagsCommand::Clear { name } => app.articles.tags().clear(&name).await?,
        },
    }

    Ok(())
}
