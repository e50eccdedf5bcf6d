//! Include/exclude/prune filtering and root directory scan.
//!
//! Patterns must match the whole relative path. An empty pattern is disabled.

use crate::items::TransferItem;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use regex::Regex;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    prune_dir: Option<Regex>,
}

fn compile(pattern: &str, what: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!("^(?:{})$", pattern))
        .map(Some)
        .with_context(|| format!("Invalid {} regex {:?}", what, pattern))
}

impl PathFilter {
    pub fn new(include: &str, exclude: &str, prune_dir: &str) -> Result<Self> {
        Ok(Self {
            include: compile(include, "include")?,
            exclude: compile(exclude, "exclude")?,
            prune_dir: compile(prune_dir, "prune dir")?,
        })
    }

    pub fn accepts_file(&self, rel: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel) {
                return false;
            }
        }
        self.include.as_ref().map_or(true, |r| r.is_match(rel))
    }

    pub fn prunes_dir(&self, rel: &str) -> bool {
        self.prune_dir.as_ref().is_some_and(|r| r.is_match(rel))
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.to_string_lossy().replace('\\', "/"))
}

/// Walk `root` and return every regular file the filter accepts, sorted by
/// path. `skip_name` (the transfer log) is never sent from the top level.
pub fn scan_root(root: &Path, filter: &PathFilter, skip_name: &str) -> Result<Vec<TransferItem>> {
    let prune_root = root.to_path_buf();
    let prune_filter = filter.clone();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            if !is_dir {
                return true;
            }
            match relative_name(&prune_root, entry.path()) {
                Some(rel) => !prune_filter.prunes_dir(&rel),
                None => true,
            }
        })
        .build();

    let mut items = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = relative_name(root, entry.path()) else {
            continue;
        };
        if rel == skip_name || !filter.accepts_file(&rel) {
            continue;
        }
        let size = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?
            .len();
        items.push(TransferItem::new(rel, i64::try_from(size).ok()));
    }

    tracing::debug!(count = items.len(), root = %root.display(), "Scanned root directory");
    Ok(items)
}
