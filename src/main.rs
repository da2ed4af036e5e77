mod config;
mod download;
mod extract;
mod github;
mod manifest;
mod pool;
mod ratelimit;
mod scrape;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::{Config, OutputLayout};
use extract::ExtractPolicy;
use github::GitHubClient;
use manifest::Manifest;
use pool::{default_workers, Shutdown};
use ratelimit::Pacer;
use scrape::ScrapeOptions;

/// Search requests per minute the search endpoint tolerates
const SEARCH_RATE_PER_MINUTE: u32 = 10;

#[derive(Parser)]
#[command(name = "gh-corpus")]
#[command(about = "Build a deduplicated source-file corpus from top GitHub repositories")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  gh-corpus run -l python,javascript -e py,js -o ./corpus
  gh-corpus scrape -l rust -o ./corpus      # manifest only
  gh-corpus download -o ./corpus            # archives from manifest
  gh-corpus extract -e rs -o ./corpus       # unique files from archives")]
struct Cli {
    /// GitHub token (falls back to GITHUB_TOKEN, GH_TOKEN, then `gh auth token`)
    #[arg(short = 't', long, global = true)]
    github_token: Option<String>,

    /// Worker count for parallel stages (default: hardware parallelism)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Print per-request timing
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover repositories and write the manifest
    Scrape {
        /// Languages to search for (comma-separated or repeated)
        #[arg(short, long, required = true)]
        languages: Vec<String>,

        /// Search sort orders crossed with every language
        #[arg(short, long, default_values_t = [String::from("stars"), String::from("forks")])]
        sorts: Vec<String>,

        /// Pages fetched per (language, sort) pair
        #[arg(short, long, default_value = "10")]
        pages: u32,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Download every archive from the manifest that is not already present
    Download {
        /// Output directory (holding repositories.csv)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Extract unique files from the downloaded archives
    Extract {
        /// Extensions to extract (empty = extract everything, keeping structure)
        #[arg(short, long)]
        extensions: Vec<String>,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Full pipeline: scrape, download, extract
    Run {
        /// Languages to search for (comma-separated or repeated)
        #[arg(short, long, required = true)]
        languages: Vec<String>,

        /// Search sort orders crossed with every language
        #[arg(short, long, default_values_t = [String::from("stars"), String::from("forks")])]
        sorts: Vec<String>,

        /// Pages fetched per (language, sort) pair
        #[arg(short, long, default_value = "10")]
        pages: u32,

        /// Extensions to extract (empty = extract everything, keeping structure)
        #[arg(short, long)]
        extensions: Vec<String>,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Check GitHub API rate limit
    RateLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n\x1b[33m..\x1b[0m Interrupted: finishing in-flight items, not starting new ones");
                shutdown.trigger();
            }
        });
    }

    let workers = cli.workers.unwrap_or_else(default_workers).max(1);

    match cli.command {
        Commands::Scrape { languages, sorts, pages, output } => {
            let client = authenticated_client(&cli.github_token, cli.debug)?;
            let layout = OutputLayout::new(output);
            let options = ScrapeOptions {
                languages: split_terms(&languages),
                sorts: split_terms(&sorts),
                pages,
                workers,
            };
            let pacer = Pacer::new(SEARCH_RATE_PER_MINUTE, 1);
            scrape::scrape(&client, &layout, &options, &pacer, &shutdown).await?;
        }

        Commands::Download { output } => {
            let client = authenticated_client(&cli.github_token, cli.debug)?;
            let layout = OutputLayout::new(output);
            let manifest = Manifest::read(&layout.manifest_path())?;
            eprintln!("\x1b[36m[download]\x1b[0m {} archives in manifest", manifest.len());
            download::download(&client, &layout, manifest, workers, &shutdown).await?;
        }

        Commands::Extract { extensions, output } => {
            let layout = OutputLayout::new(output);
            let policy = ExtractPolicy::from_extensions(&extensions);
            extract::extract(&layout, policy, workers, &shutdown).await?;
        }

        Commands::Run { languages, sorts, pages, extensions, output } => {
            let client = authenticated_client(&cli.github_token, cli.debug)?;
            let layout = OutputLayout::new(output);
            let policy = ExtractPolicy::from_extensions(&extensions);

            eprintln!("\x1b[36m..\x1b[0m Scraping repositories...");
            let options = ScrapeOptions {
                languages: split_terms(&languages),
                sorts: split_terms(&sorts),
                pages,
                workers,
            };
            let pacer = Pacer::new(SEARCH_RATE_PER_MINUTE, 1);
            let manifest = scrape::scrape(&client, &layout, &options, &pacer, &shutdown).await?;

            eprintln!("\x1b[36m..\x1b[0m Downloading all repositories...");
            download::download(&client, &layout, manifest, workers, &shutdown).await?;

            eprintln!("\x1b[36m..\x1b[0m Unzipping files...");
            extract::extract(&layout, policy, workers, &shutdown).await?;

            eprintln!("\x1b[32mok\x1b[0m Done");
        }

        Commands::RateLimit => {
            let client = authenticated_client(&cli.github_token, cli.debug)?;
            let (core, search) = client.rate_limit().await?;
            println!("core:   {}/{} remaining (resets at {})", core.remaining, core.limit, format_reset(core.reset));
            println!("search: {}/{} remaining (resets at {})", search.remaining, search.limit, format_reset(search.reset));
        }
    }

    Ok(())
}

/// Resolve the token and build the client. The token is mandatory for any
/// network stage; a missing token is a configuration error reported before
/// any request goes out.
fn authenticated_client(explicit: &Option<String>, debug: bool) -> Result<GitHubClient> {
    let token = explicit
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(Config::github_token);

    match token {
        Some(token) => Ok(GitHubClient::new(token, debug)),
        None => anyhow::bail!(
            "No GitHub token found. Pass --github-token, set GITHUB_TOKEN, or run: gh auth login"
        ),
    }
}

/// Values may be repeated flags or comma-separated lists; both flatten
fn split_terms(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

fn format_reset(reset: u64) -> String {
    chrono::DateTime::from_timestamp(reset as i64, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "??:??:??".to_string())
}
