mod catalog;
mod clean;
mod cli;
mod config;
mod retry;
mod state;
mod store;
mod sync;
mod types;

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use catalog::{CatalogClient, DanbooruClient};
use cli::Command;
use state::MetadataStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Dump(args) => run_dump(args).await,
        Command::Clean(args) => run_clean(args).await,
        Command::Status(args) => run_status(args).await,
    }
}

fn get_db_path(directory: &Path) -> PathBuf {
    directory.join(store::DB_FILE)
}

/// Open the database of an existing dump, refusing to create one.
async fn open_existing(path: &str) -> anyhow::Result<Option<(PathBuf, state::SqliteMetadataDb)>> {
    let directory = config::expand_tilde(path);
    let db_path = get_db_path(&directory);
    if !db_path.exists() {
        println!("No database found at {}", db_path.display());
        println!("Run a dump first to create the database.");
        return Ok(None);
    }
    let db = state::SqliteMetadataDb::open(&db_path).await?;
    Ok(Some((directory, db)))
}

async fn run_dump(args: cli::DumpArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::debug!("{:?}", config);

    let api_key = match config.api_key.clone() {
        Some(key) => key,
        None if std::io::stdin().is_terminal() => tokio::task::block_in_place(|| {
            rpassword::prompt_password(format!("API key for {}: ", config.username))
        })
        .context("Failed to read API key")?,
        None => bail!("--api-key (or BOORU_API_KEY) is required"),
    };
    if api_key.trim().is_empty() {
        bail!("API key must not be empty");
    }
    let credentials = config.credentials(api_key);

    tokio::fs::create_dir_all(&config.directory)
        .await
        .with_context(|| format!("Failed to create {}", config.directory.display()))?;
    let db_path = get_db_path(&config.directory);
    let db = state::SqliteMetadataDb::open(&db_path)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))?;

    let http = catalog::http_client(catalog::USER_AGENT)?;
    let danbooru = DanbooruClient::new(http.clone(), &config.base_url, Some(credentials.clone()));
    let catalog: &dyn CatalogClient = &danbooru;

    tracing::info!("Dumping {} into {}", config.base_url, config.directory.display());
    sync::run_dump(
        catalog,
        &http,
        Some(&credentials),
        &db,
        &config.to_dump_config(),
    )
    .await?;
    Ok(())
}

fn confirm_prompt(count: u64) -> std::io::Result<bool> {
    print!("Delete {count} posts and their files? [y/N] ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

async fn run_clean(args: cli::CleanArgs) -> anyhow::Result<()> {
    let Some((directory, db)) = open_existing(&args.path).await? else {
        return Ok(());
    };
    let layout = store::Layout::new(&directory);
    if !layout.images_dir().is_dir() {
        bail!("{} is not a dump directory", directory.display());
    }

    let yes = args.yes;
    let summary = clean::run_clean(&db, &layout, &args.predicate, |count| {
        if yes {
            Ok(true)
        } else {
            confirm_prompt(count)
        }
    })
    .await?;

    if summary.matched > 0 && summary.rows_deleted == 0 {
        println!("Cancelled.");
    }
    Ok(())
}

async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let Some((directory, db)) = open_existing(&args.path).await? else {
        return Ok(());
    };
    let summary = db.get_summary().await?;

    println!("Database: {}", get_db_path(&directory).display());
    println!();
    println!("Posts:      {}", summary.total_posts);
    println!();

    let Some(run) = summary.last_run else {
        println!("No sync runs recorded.");
        return Ok(());
    };
    println!("Last run ({} mode):", run.mode);
    if let Some(started) = run.started_at {
        println!("  Started:    {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    match run.completed_at {
        Some(completed) => println!(
            "  Completed:  {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("  Completed:  (interrupted)"),
    }
    if let Some(cursor) = run.next_cursor {
        println!("  Next:       {cursor}");
    }
    println!("  Pages:      {}", run.pages);
    println!("  Updated:    {}", run.updated);
    println!("  Downloaded: {}", run.downloaded);
    println!("  Invalid:    {}", run.invalid);
    Ok(())
}
