//! Persisted set of already-forwarded message fingerprints.
//!
//! A fingerprint is the full text of a scraped message, used verbatim as the
//! deduplication key. The set only ever grows and is rewritten to disk after
//! every addition so a restart never re-forwards an old message.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// Set of forwarded fingerprints backed by a JSON array file.
pub struct SentCache {
    path: PathBuf,
    entries: HashSet<String>,
}

impl SentCache {
    /// Load the cache from `path`.
    ///
    /// A missing or unparseable file loads as an empty cache; that loses
    /// dedup history but must never stop the relay from starting.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<String>>(&content) {
                Ok(list) => list.into_iter().collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "sent cache is malformed; starting empty");
                    HashSet::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read sent cache; starting empty");
                HashSet::new()
            }
        };

        Self { path, entries }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a fingerprint and synchronously rewrite the backing file.
    ///
    /// The whole set is rewritten on every addition. Fine at OTP-relay
    /// volumes; a scalability ceiling if message volume ever grows large.
    pub fn insert(&mut self, fingerprint: impl Into<String>) -> Result<()> {
        self.entries.insert(fingerprint.into());
        self.save()
    }

    fn save(&self) -> Result<()> {
        let mut list: Vec<&str> = self.entries.iter().map(String::as_str).collect();
        list.sort_unstable();

        let content = serde_json::to_string(&list).context("Failed to serialize sent cache")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write sent cache: {}", self.path.display()))?;
        Ok(())
    }
}
