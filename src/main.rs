use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use linkharvest::config::Config;
use linkharvest::feed::{self, FeedSettings};
use linkharvest::harvest::{
    HarvestContext, HarvestSettings, Harvester, HttpResolver, ResolverSettings,
};
use linkharvest::search::HttpSearchClient;
use linkharvest::storage::{Database, DatabaseError};
use linkharvest::util::truncate_chars;

/// Get the config directory path (~/.config/linkharvest/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("linkharvest"))
}

/// Creates `dir` if needed and restricts it to the current user on Unix.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to read directory metadata");
            }
        }
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "linkharvest",
    about = "Harvest shared links from search results and publish the most popular as RSS"
)]
struct Args {
    /// Config file (default: ~/.config/linkharvest/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new posts for a query and fold their links into the tallies
    Harvest {
        #[arg(long, short)]
        query: String,

        /// Cancel the run if it has not finished after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
    },
    /// Render the RSS feed for a query
    Feed {
        #[arg(long, short)]
        query: String,

        /// Write the feed here instead of stdout
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print the ranked tallies for a query
    Tallies {
        #[arg(long, short)]
        query: String,

        /// Rows to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

async fn open_database(config: &Config, config_dir: &Path) -> Result<Database> {
    let db_path = match &config.database_path {
        Some(path) => PathBuf::from(path),
        None => config_dir.join("linkharvest.db"),
    };
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent)?;
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(db_path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("Another linkharvest process is using the database. Please wait and try again.")
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn run_harvest(config: &Config, db: Database, query: &str, deadline: Option<u64>) -> Result<()> {
    let timeout = Duration::from_secs(config.request_timeout_secs);

    let endpoint = url::Url::parse(&config.search_base_url).context("Invalid search_base_url")?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("linkharvest/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let search = HttpSearchClient::new(http, endpoint)
        .with_bearer_token(config.bearer_token())
        .with_page_size(config.page_size)
        .with_timeout(timeout);

    let resolver = HttpResolver::new(ResolverSettings {
        timeout,
        max_redirects: config.max_redirects,
        allow_private_addresses: config.allow_private_addresses,
    })
    .context("Failed to build resolver HTTP client")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling harvest");
                cancel.cancel();
            }
        });
    }
    if let Some(secs) = deadline {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::warn!(deadline_secs = secs, "Deadline reached, cancelling harvest");
            cancel.cancel();
        });
    }

    let ctx = HarvestContext {
        search: Arc::new(search),
        resolver: Arc::new(resolver),
        store: Arc::new(db),
        cancel,
    };
    let mut harvester = Harvester::new(ctx, HarvestSettings::from_config(config));

    let report = harvester
        .run(query)
        .await
        .with_context(|| format!("Harvest for {:?} failed", query))?;

    println!(
        "Harvested {:?}: {} posts, {} links, {} resolved, {} failed, {} addresses updated, {} not persisted",
        report.query,
        report.posts,
        report.candidates,
        report.resolved,
        report.resolve_failures,
        report.committed.len(),
        report.persist_failures
    );
    Ok(())
}

async fn run_feed(config: &Config, db: &Database, query: &str, output: Option<&Path>) -> Result<()> {
    let settings = FeedSettings::from_config(config);
    let feed = feed::assemble(db, query, &settings, Utc::now())
        .await
        .context("Failed to assemble feed")?;
    let xml = feed::render_rss(&feed).context("Failed to render feed")?;

    match output {
        Some(path) => {
            feed::write_to_file(&xml, path)?;
            println!("Wrote {} items to {}", feed.items.len(), path.display());
        }
        None => print!("{}", xml),
    }
    Ok(())
}

async fn run_tallies(config: &Config, db: &Database, query: &str, limit: usize) -> Result<()> {
    let settings = FeedSettings {
        max_items: limit,
        ..FeedSettings::from_config(config)
    };
    let feed = feed::assemble(db, query, &settings, Utc::now())
        .await
        .context("Failed to load tallies")?;

    if feed.items.is_empty() {
        println!("No tallies for {:?} in the last {} days", query, settings.window.num_days());
        return Ok(());
    }

    println!("{:>6}  {:<20}  {:<50}  TITLE", "SCORE", "LAST ACTIVE", "ADDRESS");
    for item in &feed.items {
        println!(
            "{:>6}  {:<20}  {:<50}  {}",
            item.score,
            item.last_active.format("%Y-%m-%d %H:%M"),
            truncate_chars(&item.address, 50),
            truncate_chars(&item.title, 60)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;
    tracing::debug!(config = ?config, "Effective configuration");

    if config.database_path.is_none() {
        ensure_private_dir(&config_dir)?;
    }
    let db = open_database(&config, &config_dir).await?;

    match args.command {
        Command::Harvest { query, deadline } => run_harvest(&config, db, &query, deadline).await,
        Command::Feed { query, output } => run_feed(&config, &db, &query, output.as_deref()).await,
        Command::Tallies { query, limit } => run_tallies(&config, &db, &query, limit).await,
    }
}
