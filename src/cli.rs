use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "boorudl-rs",
    version,
    about = "Mirror a Danbooru post catalog into a local content-addressed store"
)]
pub struct Cli {
    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download posts and metadata into a directory
    Dump(DumpArgs),

    /// Delete posts matching an SQL predicate, with their files
    Clean(CleanArgs),

    /// Show the stored post count and the last sync run
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    /// Output directory
    pub path: String,

    /// First post id to fetch
    #[arg(short = 's', long, default_value_t = 1)]
    pub start_id: u64,

    /// Last post id to fetch (0 = unlimited)
    #[arg(short = 'e', long, default_value_t = 0)]
    pub end_id: u64,

    /// Walk result pages instead of ascending ids; -s and -e are ignored
    #[arg(short = 'p', long)]
    pub use_paging: bool,

    /// First page (requires --use-paging, default 1)
    #[arg(long)]
    pub start_page: Option<u64>,

    /// Last page to process (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub end_page: u64,

    /// Posts per page
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub limit: u32,

    /// Tag query, e.g. 'score:>=100' (requires --use-paging)
    #[arg(long)]
    pub query: Option<String>,

    /// Extra tags narrowing the id walk
    #[arg(long, default_value = "")]
    pub tags: String,

    /// Comma-separated file extensions to download
    #[arg(long, value_delimiter = ',', default_value = "png,jpg")]
    pub ext: Vec<String>,

    /// Skip hashing files whose metadata is unchanged
    #[arg(short = 'i', long)]
    pub ignore_hash_check: bool,

    /// Include deleted posts
    #[arg(short = 'd', long)]
    pub deleted: bool,

    /// Downscale large files to PNG
    #[arg(long)]
    pub resize: bool,

    /// Resize target width
    #[arg(long, default_value_t = 512)]
    pub resize_width: u32,

    /// Resize target height
    #[arg(long, default_value_t = 512)]
    pub resize_height: u32,

    /// Only resize bodies larger than this many KiB
    #[arg(long, default_value_t = 1024)]
    pub resize_threshold_kb: u64,

    /// Number of concurrent plan/verify workers
    #[arg(long, default_value_t = 8)]
    pub threads: u16,

    /// Attempts per request before giving up
    #[arg(long, default_value_t = 10)]
    pub retry_attempts: u32,

    /// Seconds to wait between attempts
    #[arg(long, default_value_t = 3)]
    pub retry_delay: u64,

    /// Continue from the cursor stored by the last run
    #[arg(long)]
    pub resume: bool,

    /// Catalog base URL
    #[arg(long, default_value = "https://danbooru.donmai.us")]
    pub base_url: String,

    /// Danbooru account name
    #[arg(long, env = "BOORU_USERNAME")]
    pub username: Option<String>,

    /// Danbooru API key (if not provided, will prompt).
    /// Prefer the BOORU_API_KEY environment variable over the flag.
    #[arg(long, env = "BOORU_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    /// Output directory of a previous dump
    pub path: String,

    /// SQL predicate over the posts table, e.g. "rating = 'e'"
    pub predicate: String,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Output directory of a previous dump
    pub path: String,
}
