//! Download stage: fetch every archive named by the manifest that is not
//! already on disk.
//!
//! The existence of the target file is the resumability marker, so re-running
//! after a partial failure only fetches what is missing. The write itself uses
//! an exclusive create: if two workers ever race on the same target, the loser
//! just discards its bytes.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::OutputLayout;
use crate::github::GitHubClient;
use crate::manifest::{DownloadTask, Manifest};
use crate::pool::{Shutdown, WorkQueue};

#[derive(Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// Target already on disk; no network call was made
    Skipped,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Fetch all archives from the manifest into `{output}/repositories/`
pub async fn download(
    client: &GitHubClient,
    layout: &OutputLayout,
    manifest: Manifest,
    workers: usize,
    shutdown: &Shutdown,
) -> Result<DownloadSummary> {
    let target_dir = layout.ensure_repositories_dir()?;

    let queue = WorkQueue::new(manifest.tasks, shutdown.clone());
    let total = queue.total();

    let downloaded = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let client = client.clone();
            let target_dir = target_dir.clone();
            let downloaded = Arc::clone(&downloaded);
            let skipped = Arc::clone(&skipped);
            let failed = Arc::clone(&failed);

            tokio::spawn(async move {
                while let Some((task, position)) = queue.pop() {
                    eprintln!(
                        "\x1b[36m[download]\x1b[0m [{}/{}] '{}' from {}",
                        position, total, task.full_name, task.archive_url
                    );
                    match download_task(&client, &target_dir, &task).await {
                        Ok(DownloadOutcome::Downloaded) => {
                            downloaded.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(DownloadOutcome::Skipped) => {
                            eprintln!(
                                "  \x1b[90malready present, skipping '{}'\x1b[0m",
                                task.full_name
                            );
                            skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // One bad task never aborts the batch
                            eprintln!(
                                "  \x1b[33m⚠\x1b[0m '{}' failed: {}",
                                task.full_name, e
                            );
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    futures::future::join_all(handles).await;

    let summary = DownloadSummary {
        downloaded: downloaded.load(Ordering::Relaxed),
        skipped: skipped.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    };
    eprintln!(
        "\x1b[32mok\x1b[0m Downloaded {} archives ({} already present, {} failed)",
        summary.downloaded, summary.skipped, summary.failed
    );
    Ok(summary)
}

/// Download a single archive. Checks for the target before touching the
/// network; writes with `create_new` so a concurrent winner's file is never
/// corrupted.
pub async fn download_task(
    client: &GitHubClient,
    target_dir: &Path,
    task: &DownloadTask,
) -> Result<DownloadOutcome> {
    let target = target_dir.join(task.archive_file_name());

    if target.exists() {
        return Ok(DownloadOutcome::Skipped);
    }

    let bytes = client.download_archive(&task.archive_url).await?;

    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(f) => f,
        // Another worker won the race; its file is complete or in progress
        // under its exclusive handle. Ours is discarded.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Ok(DownloadOutcome::Skipped);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to create {}", target.display()));
        }
    };

    file.write_all(&bytes)
        .with_context(|| format!("Failed to write {}", target.display()))?;

    Ok(DownloadOutcome::Downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> GitHubClient {
        GitHubClient::new("test-token".into(), false)
    }

    fn task_with_bad_url(name: &str) -> DownloadTask {
        DownloadTask {
            full_name: name.into(),
            // Unroutable: any attempt to fetch this fails fast
            archive_url: "http://127.0.0.1:1/zipball/abc".into(),
            commit_sha: "abc".into(),
        }
    }

    #[tokio::test]
    async fn test_existing_target_skipped_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let task = task_with_bad_url("owner/repo");

        // Pre-existing nonzero file: the bad URL must never be contacted
        std::fs::write(tmp.path().join("owner_repo.zip"), b"archive bytes").unwrap();

        let outcome = download_task(&test_client(), tmp.path(), &task).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Skipped);

        // File untouched
        let content = std::fs::read(tmp.path().join("owner_repo.zip")).unwrap();
        assert_eq!(content, b"archive bytes");
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let task = task_with_bad_url("a/b");
        std::fs::write(tmp.path().join("a_b.zip"), b"x").unwrap();

        for _ in 0..2 {
            let outcome = download_task(&test_client(), tmp.path(), &task).await.unwrap();
            assert_eq!(outcome, DownloadOutcome::Skipped);
        }
    }
}
