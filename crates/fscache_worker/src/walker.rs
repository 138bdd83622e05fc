//! Stack-based directory walker.
//!
//! Yields `(path, metadata)` for every entry reachable from a root without
//! recursion, so tree depth only grows a `Vec`, never the call stack.
//!
//! Invariants:
//! - Metadata is read with `lstat` semantics (`symlink_metadata`).
//! - A symbolic link is never descended into, even when it points at a
//!   directory. This is what keeps link cycles from looping forever.
//! - A directory that cannot be listed, or an entry that cannot be stat'ed,
//!   is skipped with a warning and the walk goes on.

use std::fs::{self, Metadata, ReadDir};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::cancel::CancellationToken;

/// Recoverable walk failures. Logged and counted, never returned.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("cannot list directory {path}: {source}")]
    ListDir { path: PathBuf, source: io::Error },

    #[error("cannot read entry in {path}: {source}")]
    ReadEntry { path: PathBuf, source: io::Error },

    #[error("cannot stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },
}

/// One visited filesystem entry.
#[derive(Debug)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// Lazy depth-first walk over one root.
pub struct TreeWalker {
    root: PathBuf,
    pending: Vec<PathBuf>,
    current: Option<(PathBuf, ReadDir)>,
    cancel: Option<CancellationToken>,
    skipped: usize,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            pending: vec![root.clone()],
            root,
            current: None,
            cancel: None,
            skipped: 0,
        }
    }

    /// Stop yielding entries once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of directories or entries skipped because of errors.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Start over from the root, dropping any progress.
    pub fn restart(&mut self) {
        self.pending = vec![self.root.clone()];
        self.current = None;
        self.skipped = 0;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn skip(&mut self, err: WalkError) {
        warn!("Skipping: {}", err);
        self.skipped += 1;
    }
}

impl Iterator for TreeWalker {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            if self.is_cancelled() {
                return None;
            }

            let Some((dir, entries)) = self.current.as_mut() else {
                let dir = self.pending.pop()?;
                match fs::read_dir(&dir) {
                    Ok(entries) => self.current = Some((dir, entries)),
                    Err(source) => self.skip(WalkError::ListDir { path: dir, source }),
                }
                continue;
            };

            let entry = match entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(source)) => {
                    let path = dir.clone();
                    self.skip(WalkError::ReadEntry { path, source });
                    continue;
                }
                None => {
                    self.current = None;
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(source) => {
                    self.skip(WalkError::Stat { path, source });
                    continue;
                }
            };

            let file_type = metadata.file_type();
            if file_type.is_dir() && !file_type.is_symlink() {
                self.pending.push(path.clone());
            }

            return Some(WalkEntry { path, metadata });
        }
    }
}
