use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct Config;

impl Config {
    /// Get GitHub token from environment or gh CLI config
    pub fn github_token() -> Option<String> {
        // First try environment variable
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try GH_TOKEN (used by gh CLI)
        if let Ok(token) = std::env::var("GH_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try to get from gh CLI config
        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Filesystem layout under the output directory.
///
/// `repositories/` holds downloaded archives, `repository-files/` holds
/// extracted unique files, `repositories.csv` is the manifest between the
/// scrape and download stages.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("repository-files")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("repositories.csv")
    }

    /// Create the archive directory (and the root) if missing
    pub fn ensure_repositories_dir(&self) -> Result<PathBuf> {
        let dir = self.repositories_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Create the extracted-files directory (and the root) if missing
    pub fn ensure_files_dir(&self) -> Result<PathBuf> {
        let dir = self.files_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }
}
