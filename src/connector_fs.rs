//! Filesystem document source.
//!
//! Walks a root directory and turns every matching file into a
//! [`Document`]: id is the path relative to the root, title is the file
//! name, timestamp is the modification time.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use rag_harness_core::models::Document;

use crate::config::IngestConfig;

pub fn scan_filesystem(root: &Path, config: &IngestConfig) -> Result<Vec<Document>> {
    if !root.exists() {
        bail!("Ingest root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match file_to_document(path, &rel_str)? {
            Some(doc) => docs.push(doc),
            None => tracing::warn!(path = %rel_str, "skipping file that is not valid UTF-8"),
        }
    }

    // Sort for deterministic ordering
    docs.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(docs)
}

fn file_to_document(path: &Path, relative_path: &str) -> Result<Option<Document>> {
    let metadata = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let modified_secs = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(None);
    };

    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string());

    Ok(Some(Document {
        id: relative_path.to_string(),
        title,
        text,
        source_timestamp: modified_secs,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}
