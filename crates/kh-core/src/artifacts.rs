use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Wordlist metadata the keyspace calculator and task generator consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordlistMeta {
    pub id: Uuid,
    pub name: String,
    pub line_count: u64,
    pub file_hash: String,
    pub size_bytes: u64,
}

/// Rule-file metadata; `rule_count` feeds the multiplication factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFileMeta {
    pub id: Uuid,
    pub name: String,
    pub rule_count: u64,
    pub file_hash: String,
}

/// Hashcat binary metadata; jobs whose preset names a missing binary are
/// skipped by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryMeta {
    pub id: Uuid,
    pub name: String,
    pub file_hash: String,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Opaque lookup of wordlist/rule/binary metadata by id.
///
/// File storage, hashing, and sync live outside the core; the engine only
/// reads counts and names through this boundary.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn wordlist(&self, id: Uuid) -> Result<WordlistMeta>;
    async fn rule_file(&self, id: Uuid) -> Result<RuleFileMeta>;
    async fn binary(&self, id: Uuid) -> Result<BinaryMeta>;

    /// True when the binary exists; missing ids are not an error here.
    async fn binary_exists(&self, id: Uuid) -> bool {
        self.binary(id).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory registry used by the daemon bootstrap and tests.
#[derive(Default)]
pub struct MemoryArtifactStore {
    wordlists: RwLock<HashMap<Uuid, WordlistMeta>>,
    rule_files: RwLock<HashMap<Uuid, RuleFileMeta>>,
    binaries: RwLock<HashMap<Uuid, BinaryMeta>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_wordlist(&self, meta: WordlistMeta) {
        self.wordlists
            .write()
            .expect("artifact lock poisoned")
            .insert(meta.id, meta);
    }

    pub fn insert_rule_file(&self, meta: RuleFileMeta) {
        self.rule_files
            .write()
            .expect("artifact lock poisoned")
            .insert(meta.id, meta);
    }

    pub fn insert_binary(&self, meta: BinaryMeta) {
        self.binaries
            .write()
            .expect("artifact lock poisoned")
            .insert(meta.id, meta);
    }

    /// Convenience for tests: register a wordlist with just a line count.
    pub fn add_wordlist(&self, line_count: u64) -> Uuid {
        let id = Uuid::new_v4();
        self.insert_wordlist(WordlistMeta {
            id,
            name: format!("wordlist-{id}"),
            line_count,
            file_hash: String::new(),
            size_bytes: 0,
        });
        id
    }

    /// Convenience for tests: register a rule file with just a rule count.
    pub fn add_rule_file(&self, rule_count: u64) -> Uuid {
        let id = Uuid::new_v4();
        self.insert_rule_file(RuleFileMeta {
            id,
            name: format!("rules-{id}"),
            rule_count,
            file_hash: String::new(),
        });
        id
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn wordlist(&self, id: Uuid) -> Result<WordlistMeta> {
        self.wordlists
            .read()
            .expect("artifact lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("wordlist", id))
    }

    async fn rule_file(&self, id: Uuid) -> Result<RuleFileMeta> {
        self.rule_files
            .read()
            .expect("artifact lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("rule file", id))
    }

    async fn binary(&self, id: Uuid) -> Result<BinaryMeta> {
        self.binaries
            .read()
            .expect("artifact lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("binary", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_round_trip() {
        let store = MemoryArtifactStore::new();
        let id = store.add_wordlist(14_344_384);
        let meta = store.wordlist(id).await.expect("wordlist exists");
        assert_eq!(meta.line_count, 14_344_384);

        let missing = store.wordlist(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(CoreError::NotFound { .. })));
    }
}
