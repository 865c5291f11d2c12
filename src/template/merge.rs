//! Recursive include flattening.
//!
//! Every inlined file is bracketed by a begin/end marker pair naming its
//! canonical path. The markers are geometry-file comments, so the merged
//! document stays a valid standalone setup file, and they let later stages
//! find "line N of file F" even when F's lines are interleaved with nested
//! includes.
use super::render_lines;
use crate::error::SweepError;
use std::fs;
use std::path::{Path, PathBuf};

/// Keyword that starts an include line in geometry templates.
pub const INCLUDE_KEYWORD: &str = "Include";
/// Prefix shared by all marker lines.
pub const MARKER_PREFIX: &str = "//@";
/// Include nesting deeper than this is treated as a cycle.
pub const MAX_INCLUDE_DEPTH: usize = 1024;

const BEGIN_TAG: &str = "begin-include";
const END_TAG: &str = "end-include";

/// A parsed marker line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    Begin(&'a str),
    End(&'a str),
}

pub fn begin_marker(file: &str) -> String {
    format!("{MARKER_PREFIX} {BEGIN_TAG} {file}")
}

pub fn end_marker(file: &str) -> String {
    format!("{MARKER_PREFIX} {END_TAG} {file}")
}

pub fn parse_marker(line: &str) -> Option<Marker<'_>> {
    let rest = line.strip_prefix(MARKER_PREFIX)?.strip_prefix(' ')?;
    if let Some(file) = rest.strip_prefix(BEGIN_TAG).and_then(|r| r.strip_prefix(' ')) {
        return Some(Marker::Begin(file));
    }
    rest.strip_prefix(END_TAG)
        .and_then(|r| r.strip_prefix(' '))
        .map(Marker::End)
}

/// A template with all includes inlined and bracketed by markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDocument {
    root: String,
    lines: Vec<String>,
}

impl MergedDocument {
    /// Wrap already-flat lines as the sole contents of `root`.
    #[cfg(test)]
    pub fn from_flat(root: &str, body: Vec<String>) -> Self {
        let mut lines = Vec::with_capacity(body.len() + 2);
        lines.push(begin_marker(root));
        lines.extend(body);
        lines.push(end_marker(root));
        Self {
            root: root.to_string(),
            lines,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Every file inlined into this document, root first, each listed once.
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = Vec::new();
        for line in &self.lines {
            if let Some(Marker::Begin(file)) = parse_marker(line) {
                let file = PathBuf::from(file);
                if !sources.contains(&file) {
                    sources.push(file);
                }
            }
        }
        sources
    }

    pub fn render(&self) -> String {
        render_lines(&self.lines)
    }
}

/// Flatten `root` and everything it includes into one document.
pub fn merge(root: &Path) -> Result<MergedDocument, SweepError> {
    let resolved = canonical(root)?;
    let label = resolved.display().to_string();
    let mut lines = vec![begin_marker(&label)];
    merge_into(&resolved, 0, &mut lines)?;
    lines.push(end_marker(&label));
    tracing::debug!(root = %label, lines = lines.len(), "merged template");
    Ok(MergedDocument { root: label, lines })
}

fn merge_into(path: &Path, depth: usize, out: &mut Vec<String>) -> Result<(), SweepError> {
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(SweepError::Cycle {
            path: path.to_path_buf(),
            limit: MAX_INCLUDE_DEPTH,
        });
    }
    let text = fs::read_to_string(path).map_err(|source| SweepError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for (index, line) in text.lines().enumerate() {
        if line.trim_start().starts_with(MARKER_PREFIX) {
            return Err(SweepError::malformed(format!(
                "{}:{} starts with the reserved marker prefix {MARKER_PREFIX:?}",
                path.display(),
                index + 1
            )));
        }
        match include_target(line) {
            Some(Ok(target)) => {
                let included = canonical(&dir.join(target))?;
                let label = included.display().to_string();
                out.push(begin_marker(&label));
                merge_into(&included, depth + 1, out)?;
                out.push(end_marker(&label));
            }
            Some(Err(())) => {
                return Err(SweepError::malformed(format!(
                    "{}:{} has an {INCLUDE_KEYWORD} without a file name",
                    path.display(),
                    index + 1
                )));
            }
            None => out.push(line.to_string()),
        }
    }
    Ok(())
}

fn include_target(line: &str) -> Option<Result<&str, ()>> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != INCLUDE_KEYWORD {
        return None;
    }
    Some(tokens.next().ok_or(()))
}

fn canonical(path: &Path) -> Result<PathBuf, SweepError> {
    fs::canonicalize(path).map_err(|source| SweepError::Io {
        path: path.to_path_buf(),
        source,
    })
}
