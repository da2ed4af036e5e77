//! Repository identities and the manifest exchanged between stages.
//!
//! The manifest is the durable boundary artifact: the scrape stage writes it,
//! the download stage re-reads it, so a crashed run resumes at the stage
//! boundary instead of re-discovering everything.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

const MANIFEST_HEADER: &str = "full_name,archive_url,commit_sha";

/// A repository as returned by the search API.
///
/// Identity (equality and hashing) is defined over all three fields: two
/// entries are the same repository only if full name, default branch and API
/// URL all match. The identity set collapses duplicates returned across
/// different search terms, sort orders and pages.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct RepoIdentity {
    pub full_name: String,
    pub default_branch: String,
    /// API URL of the repository (https://api.github.com/repos/{owner}/{name})
    pub url: String,
}

/// A resolved download target. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub full_name: String,
    pub archive_url: String,
    pub commit_sha: String,
}

impl DownloadTask {
    /// Archive file name on disk: full name with path separators flattened
    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.full_name.replace('/', "_"))
    }
}

/// Ordered list of resolved download tasks
#[derive(Debug, Default)]
pub struct Manifest {
    pub tasks: Vec<DownloadTask>,
}

impl Manifest {
    pub fn new(tasks: Vec<DownloadTask>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Write the manifest: one header row, then one row per task
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create manifest {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);

        writeln!(out, "{}", MANIFEST_HEADER)?;
        for task in &self.tasks {
            writeln!(out, "{},{},{}", task.full_name, task.archive_url, task.commit_sha)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read a manifest back. Malformed rows are logged and skipped; only an
    /// unreadable file is an error.
    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open manifest {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut tasks = Vec::new();
        for line in reader.lines().map_while(Result::ok).skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_row(line) {
                Some(task) => tasks.push(task),
                None => {
                    eprintln!("\x1b[33m[manifest]\x1b[0m skipping malformed row: {}", line);
                }
            }
        }

        Ok(Self { tasks })
    }
}

fn parse_row(line: &str) -> Option<DownloadTask> {
    let mut columns = line.splitn(3, ',');
    let full_name = columns.next()?.to_string();
    let archive_url = columns.next()?.to_string();
    let commit_sha = columns.next()?.to_string();
    if full_name.is_empty() || archive_url.is_empty() || commit_sha.is_empty() {
        return None;
    }
    Some(DownloadTask { full_name, archive_url, commit_sha })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn identity(name: &str, branch: &str) -> RepoIdentity {
        RepoIdentity {
            full_name: name.to_string(),
            default_branch: branch.to_string(),
            url: format!("https://api.github.com/repos/{}", name),
        }
    }

    #[test]
    fn test_identity_dedup_across_pages() {
        // Same repo on two pages collapses to one entry
        let mut set = HashSet::new();
        set.insert(identity("torvalds/linux", "master"));
        set.insert(identity("rust-lang/rust", "master"));
        set.insert(identity("torvalds/linux", "master"));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_identity_differs_on_branch() {
        let mut set = HashSet::new();
        set.insert(identity("a/b", "main"));
        set.insert(identity("a/b", "master"));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_manifest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repositories.csv");

        let manifest = Manifest::new(vec![
            DownloadTask {
                full_name: "a/b".into(),
                archive_url: "https://api.github.com/repos/a/b/zipball/abc123".into(),
                commit_sha: "abc123".into(),
            },
            DownloadTask {
                full_name: "c/d".into(),
                archive_url: "https://api.github.com/repos/c/d/zipball/def456".into(),
                commit_sha: "def456".into(),
            },
        ]);
        manifest.write(&path).unwrap();

        let read_back = Manifest::read(&path).unwrap();
        assert_eq!(read_back.tasks, manifest.tasks);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("full_name,archive_url,commit_sha\n"));
    }

    #[test]
    fn test_manifest_skips_malformed_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repositories.csv");
        std::fs::write(
            &path,
            "full_name,archive_url,commit_sha\n\
             good/repo,https://api.github.com/repos/good/repo/zipball/aaa,aaa\n\
             not-enough-columns\n\
             \n\
             also/good,https://api.github.com/repos/also/good/zipball/bbb,bbb\n",
        )
        .unwrap();

        let manifest = Manifest::read(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.tasks[0].full_name, "good/repo");
        assert_eq!(manifest.tasks[1].commit_sha, "bbb");
    }

    #[test]
    fn test_archive_file_name_flattens_separators() {
        let task = DownloadTask {
            full_name: "owner/repo".into(),
            archive_url: String::new(),
            commit_sha: String::new(),
        };
        assert_eq!(task.archive_file_name(), "owner_repo.zip");
    }
}
