//! Discovery stage: paginate the search API, dedupe repository identities,
//! resolve each to an archive URL pinned at the latest commit.
//!
//! Search pagination is intentionally sequential — the search endpoint has a
//! tiny quota and parallel pages would blow through it. Commit resolution is
//! the opposite: a high-quota per-repo read with no ordering dependency, so it
//! runs on the shared worker pool.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::OutputLayout;
use crate::github::{zipball_url, GitHubClient, SEARCH_PER_PAGE};
use crate::manifest::{DownloadTask, Manifest, RepoIdentity};
use crate::pool::{Shutdown, WorkQueue};
use crate::ratelimit::Pacer;

pub struct ScrapeOptions {
    /// Search terms (languages)
    pub languages: Vec<String>,
    /// Sort orders, each crossed with every language
    pub sorts: Vec<String>,
    /// Pages fetched per (language, sort) pair
    pub pages: u32,
    /// Commit-resolution worker count
    pub workers: usize,
}

/// Run discovery and write the manifest. Returns the manifest for chaining
/// into the download stage.
pub async fn scrape(
    client: &GitHubClient,
    layout: &OutputLayout,
    options: &ScrapeOptions,
    pacer: &Pacer,
    shutdown: &Shutdown,
) -> Result<Manifest> {
    let identities = collect_identities(client, options, pacer, shutdown).await;

    let queried = options.languages.len() * options.sorts.len() * options.pages as usize
        * SEARCH_PER_PAGE as usize;
    let duplicates = queried.saturating_sub(identities.len());
    eprintln!("\x1b[36m[scrape]\x1b[0m {} unique repositories ({} duplicates collapsed)",
        identities.len(), duplicates);

    let manifest = resolve_commits(client, identities, options.workers, shutdown).await;

    std::fs::create_dir_all(layout.root())?;
    manifest.write(&layout.manifest_path())?;
    eprintln!(
        "\x1b[32mok\x1b[0m Manifest written: {} ({} entries)",
        layout.manifest_path().display(),
        manifest.len()
    );

    Ok(manifest)
}

/// Paginate every (language, sort) pair, unioning results into the identity
/// set. A failed page is logged and skipped; the loop keeps going.
async fn collect_identities(
    client: &GitHubClient,
    options: &ScrapeOptions,
    pacer: &Pacer,
    shutdown: &Shutdown,
) -> HashSet<RepoIdentity> {
    let mut identities: HashSet<RepoIdentity> = HashSet::new();

    'outer: for language in &options.languages {
        for sort in &options.sorts {
            for page in 1..=options.pages {
                if shutdown.is_triggered() {
                    break 'outer;
                }

                pacer.acquire().await;
                eprintln!(
                    "\x1b[36m[scrape]\x1b[0m [{}/{}] fetching {}/{}...",
                    page, options.pages, language, sort
                );

                match client.search_repositories(language, sort, page).await {
                    Ok(items) => {
                        identities.extend(items);
                    }
                    Err(e) => {
                        eprintln!(
                            "  \x1b[33m⚠\x1b[0m {}/{} page {} failed: {}",
                            language, sort, page, e
                        );
                    }
                }
            }
        }
    }

    identities
}

/// Resolve the latest commit for every identity on a bounded worker pool.
/// A failed resolution drops that repository; the others are unaffected.
async fn resolve_commits(
    client: &GitHubClient,
    identities: HashSet<RepoIdentity>,
    workers: usize,
    shutdown: &Shutdown,
) -> Manifest {
    let queue = WorkQueue::new(identities.into_iter().collect(), shutdown.clone());
    let total = queue.total();

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let client = client.clone();
            tokio::spawn(async move {
                // Per-worker partial result, unioned after the join
                let mut resolved: Vec<DownloadTask> = Vec::new();
                while let Some((repo, position)) = queue.pop() {
                    eprintln!(
                        "\x1b[36m[scrape]\x1b[0m [{}/{}] resolving latest commit of '{}'...",
                        position, total, repo.full_name
                    );
                    match client.latest_commit_sha(&repo.url, &repo.default_branch).await {
                        Ok(sha) => {
                            resolved.push(DownloadTask {
                                full_name: repo.full_name,
                                archive_url: zipball_url(&repo.url, &sha),
                                commit_sha: sha,
                            });
                        }
                        Err(e) => {
                            eprintln!(
                                "  \x1b[33m⚠\x1b[0m dropping '{}': {}",
                                repo.full_name, e
                            );
                        }
                    }
                }
                resolved
            })
        })
        .collect();

    let mut tasks = Vec::with_capacity(total);
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(partial) => tasks.extend(partial),
            Err(e) => eprintln!("  \x1b[31mx\x1b[0m resolver worker panicked: {}", e),
        }
    }

    Manifest::new(tasks)
}
