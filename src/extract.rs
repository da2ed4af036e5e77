//! Extraction stage: open each downloaded archive, pull out matching entries,
//! and keep exactly one copy of every distinct file content across the whole
//! corpus.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::OutputLayout;
use crate::pool::{Shutdown, WorkQueue};

/// Corpus-wide dedup set and progress counters, shared by every worker.
///
/// Contents are keyed by blake3 hash rather than the raw bytes: O(1)
/// comparisons and bounded memory, with negligible collision probability over
/// a session. The check-and-insert runs under a single lock acquisition, so
/// two workers racing on the same content can never both observe "not seen".
#[derive(Default)]
pub struct DedupStore {
    seen: Mutex<HashSet<[u8; 32]>>,
    total_seen: AtomicUsize,
    duplicates: AtomicUsize,
    written: AtomicUsize,
}

/// Final counts, read only after all workers have joined
#[derive(Debug, PartialEq, Eq)]
pub struct ExtractSummary {
    pub total_seen: usize,
    pub duplicates: usize,
    pub written: usize,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a content key. Returns true exactly once per distinct content;
    /// the caller that gets true is the one that writes the file.
    pub fn try_claim(&self, content: &[u8]) -> bool {
        self.total_seen.fetch_add(1, Ordering::Relaxed);
        let key = *blake3::hash(content).as_bytes();

        let first_sighting = self.seen.lock().unwrap().insert(key);
        if first_sighting {
            self.written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        first_sighting
    }

    /// Account for a file written without dedup (extract-all mode)
    fn note_written(&self) {
        self.total_seen.fetch_add(1, Ordering::Relaxed);
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> ExtractSummary {
        ExtractSummary {
            total_seen: self.total_seen.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
        }
    }
}

/// What to pull out of each archive. The two policies never mix in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractPolicy {
    /// Extract every entry, preserving directory structure, no dedup.
    /// Raw corpus preservation.
    Everything,
    /// Extract entries matching one of the extensions (case-sensitive suffix
    /// match), deduplicated by content across the whole corpus.
    FilteredDedup(Vec<String>),
}

impl ExtractPolicy {
    /// Empty extension list means extract everything. Bare extensions are
    /// normalized to a leading dot ("py" -> ".py").
    pub fn from_extensions(extensions: &[String]) -> Self {
        let normalized: Vec<String> = extensions
            .iter()
            .flat_map(|e| e.split(','))
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.starts_with('.') {
                    e.to_string()
                } else {
                    format!(".{}", e)
                }
            })
            .collect();

        if normalized.is_empty() {
            ExtractPolicy::Everything
        } else {
            ExtractPolicy::FilteredDedup(normalized)
        }
    }

    fn matches(&self, entry_name: &str) -> bool {
        match self {
            ExtractPolicy::Everything => true,
            ExtractPolicy::FilteredDedup(extensions) => {
                extensions.iter().any(|ext| entry_name.ends_with(ext.as_str()))
            }
        }
    }
}

/// Extract all archives under `{output}/repositories/` into
/// `{output}/repository-files/`, returning the final counters.
pub async fn extract(
    layout: &OutputLayout,
    policy: ExtractPolicy,
    workers: usize,
    shutdown: &Shutdown,
) -> Result<ExtractSummary> {
    let archives = list_archives(&layout.repositories_dir())?;
    let out_dir = layout.ensure_files_dir()?;

    let store = Arc::new(DedupStore::new());
    let policy = Arc::new(policy);
    let queue = WorkQueue::new(archives, shutdown.clone());
    let total = queue.total();

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let store = Arc::clone(&store);
            let policy = Arc::clone(&policy);
            let out_dir = out_dir.clone();

            tokio::spawn(async move {
                while let Some((path, position)) = queue.pop() {
                    eprintln!(
                        "\x1b[36m[extract]\x1b[0m [{}/{}] unzipping '{}'",
                        position, total, path.display()
                    );

                    let store = Arc::clone(&store);
                    let policy = Arc::clone(&policy);
                    let out_dir = out_dir.clone();
                    // Zip reading is synchronous; one archive is one blocking unit
                    let result = tokio::task::spawn_blocking(move || {
                        extract_archive(&path, &out_dir, &policy, &store)
                    })
                    .await;

                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            // A broken archive never aborts the batch
                            eprintln!("  \x1b[33m⚠\x1b[0m {}", e);
                        }
                        Err(e) => {
                            eprintln!("  \x1b[31mx\x1b[0m extract worker panicked: {}", e);
                        }
                    }
                }
            })
        })
        .collect();

    futures::future::join_all(handles).await;

    let summary = store.summary();
    eprintln!("\x1b[32mok\x1b[0m Extraction finished");
    eprintln!("  total files examined = {}", summary.total_seen);
    eprintln!("  duplicates skipped   = {}", summary.duplicates);
    eprintln!("  unique files written = {}", summary.written);
    Ok(summary)
}

fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list archives in {}", dir.display()))?;

    let mut archives: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
        .collect();
    archives.sort();
    Ok(archives)
}

/// Process one archive. Entry-level failures are logged and skipped so the
/// rest of the archive still extracts.
pub fn extract_archive(
    archive_path: &Path,
    out_dir: &Path,
    policy: &ExtractPolicy,
    store: &DedupStore,
) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Not a readable zip archive: {}", archive_path.display()))?;

    let archive_stem = archive_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("archive")
        .to_string();

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                eprintln!(
                    "  \x1b[33m⚠\x1b[0m corrupt entry #{} in '{}': {}",
                    index, archive_stem, e
                );
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        if !policy.matches(&entry_name) {
            // Non-matching entries are never read
            continue;
        }

        let result = match policy {
            ExtractPolicy::Everything => {
                // enclosed_name rejects absolute paths and `..` escapes
                match entry.enclosed_name() {
                    Some(relative) => {
                        extract_preserving_structure(&mut entry, &out_dir.join(relative), store)
                    }
                    None => Err(anyhow::anyhow!("entry path escapes the output directory")),
                }
            }
            ExtractPolicy::FilteredDedup(_) => {
                extract_deduplicated(&mut entry, &entry_name, &archive_stem, out_dir, store)
            }
        };
        if let Err(e) = result {
            eprintln!("  \x1b[33m⚠\x1b[0m '{}' in '{}': {}", entry_name, archive_stem, e);
        }
    }

    Ok(())
}

fn extract_preserving_structure(
    entry: &mut impl Read,
    dest: &Path,
    store: &DedupStore,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut out = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    std::io::copy(entry, &mut out)
        .with_context(|| format!("Failed to write {}", dest.display()))?;

    store.note_written();
    Ok(())
}

fn extract_deduplicated(
    entry: &mut impl Read,
    entry_name: &str,
    archive_stem: &str,
    out_dir: &Path,
    store: &DedupStore,
) -> Result<()> {
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .context("failed to read entry contents")?;

    if !store.try_claim(&content) {
        return Ok(());
    }

    let dest = out_dir.join(unique_file_name(archive_stem, entry_name));
    std::fs::write(&dest, &content)
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    Ok(())
}

/// Collision-safe output name: archive stem plus a hash of the in-archive
/// path, keeping the original extension. Two archives containing the same
/// entry path map to distinct names; the same entry is stable across runs.
fn unique_file_name(archive_stem: &str, entry_name: &str) -> String {
    let normalized = entry_name.replace('\\', "/");
    let path_hash = blake3::hash(normalized.as_bytes()).to_hex();

    let extension = Path::new(&normalized)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    format!("{}-{}{}", archive_stem, &path_hash.as_str()[..16], extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_policy_from_extensions() {
        assert_eq!(ExtractPolicy::from_extensions(&[]), ExtractPolicy::Everything);
        assert_eq!(
            ExtractPolicy::from_extensions(&["py".into(), ".js".into()]),
            ExtractPolicy::FilteredDedup(vec![".py".into(), ".js".into()])
        );
        assert_eq!(
            ExtractPolicy::from_extensions(&["py, js".into()]),
            ExtractPolicy::FilteredDedup(vec![".py".into(), ".js".into()])
        );
    }

    #[test]
    fn test_suffix_match_is_case_sensitive() {
        let policy = ExtractPolicy::from_extensions(&["py".into()]);
        assert!(policy.matches("src/a.py"));
        assert!(!policy.matches("src/A.PY"));
        assert!(!policy.matches("src/a.pyc"));
        assert!(!policy.matches("README.md"));
    }

    #[test]
    fn test_dedup_scenario_two_py_one_txt() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("repo.zip");
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        make_zip(&archive, &[
            ("repo/a.py", b"X"),
            ("repo/b.py", b"X"),
            ("repo/c.txt", b"Y"),
        ]);

        let store = DedupStore::new();
        let policy = ExtractPolicy::from_extensions(&["py".into()]);
        extract_archive(&archive, &out, &policy, &store).unwrap();

        let summary = store.summary();
        assert_eq!(summary.total_seen, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.written, 1);

        // Exactly one output file, holding "X"; "Y" never extracted
        let outputs: Vec<_> = std::fs::read_dir(&out).unwrap().flatten().collect();
        assert_eq!(outputs.len(), 1);
        assert_eq!(std::fs::read(outputs[0].path()).unwrap(), b"X");
    }

    #[test]
    fn test_try_claim_race_single_winner() {
        let store = Arc::new(DedupStore::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if store.try_claim(b"the same content") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let summary = store.summary();
        assert_eq!(summary.total_seen, 8);
        assert_eq!(summary.duplicates, 7);
        assert_eq!(summary.written, 1);
    }

    #[test]
    fn test_counter_invariant_holds() {
        let store = DedupStore::new();
        for content in [&b"a"[..], b"b", b"a", b"c", b"b", b"b"] {
            store.try_claim(content);
        }
        let summary = store.summary();
        assert_eq!(summary.total_seen, summary.duplicates + summary.written);
        assert_eq!(summary.written, 3);
    }

    #[test]
    fn test_output_names_unique_across_archives() {
        assert_ne!(
            unique_file_name("owner_repo1", "src/main.py"),
            unique_file_name("owner_repo2", "src/main.py")
        );
        assert_ne!(
            unique_file_name("owner_repo", "a/x.py"),
            unique_file_name("owner_repo", "b/x.py")
        );
        // Stable across calls and separator styles
        assert_eq!(
            unique_file_name("r", "src/x.py"),
            unique_file_name("r", "src\\x.py")
        );
        assert!(unique_file_name("r", "src/x.py").ends_with(".py"));
    }

    #[test]
    fn test_extract_all_preserves_structure_without_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("repo.zip");
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        make_zip(&archive, &[
            ("repo/src/lib.rs", b"same"),
            ("repo/copy/lib.rs", b"same"),
            ("repo/README.md", b"docs"),
        ]);

        let store = DedupStore::new();
        extract_archive(&archive, &out, &ExtractPolicy::Everything, &store).unwrap();

        assert_eq!(std::fs::read(out.join("repo/src/lib.rs")).unwrap(), b"same");
        assert_eq!(std::fs::read(out.join("repo/copy/lib.rs")).unwrap(), b"same");
        assert_eq!(std::fs::read(out.join("repo/README.md")).unwrap(), b"docs");

        // Identical contents both written: no dedup in this mode
        let summary = store.summary();
        assert_eq!(summary.written, 3);
        assert_eq!(summary.duplicates, 0);
    }

    #[test]
    fn test_written_set_deterministic_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a_repo.zip");
        let b = tmp.path().join("b_repo.zip");
        make_zip(&a, &[("a/x.py", b"one"), ("a/y.py", b"two")]);
        make_zip(&b, &[("b/z.py", b"one"), ("b/w.py", b"three")]);

        let mut runs = Vec::new();
        for run in 0..2 {
            let out = tmp.path().join(format!("out{}", run));
            std::fs::create_dir(&out).unwrap();
            let store = DedupStore::new();
            let policy = ExtractPolicy::from_extensions(&["py".into()]);
            // Reversed order on the second run: the output set must not change
            let order: Vec<&Path> = if run == 0 { vec![&a, &b] } else { vec![&b, &a] };
            for archive in order {
                extract_archive(archive, &out, &policy, &store).unwrap();
            }
            assert_eq!(store.summary().written, 3);

            let mut contents: Vec<Vec<u8>> = std::fs::read_dir(&out)
                .unwrap()
                .flatten()
                .map(|e| std::fs::read(e.path()).unwrap())
                .collect();
            contents.sort();
            runs.push(contents);
        }
        assert_eq!(runs[0], runs[1]);
    }
}
