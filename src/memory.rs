//! Bounded semantic memory
//!
//! Each agent owns an LRU partition and everyone reads a shared one. Search
//! ranks entries by cosine similarity of term-frequency vectors, which is
//! enough to surface earlier tasks with overlapping vocabulary.

use crate::config::MemoryConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::debug;

/// Partition name readable by every agent
pub const SHARED_PARTITION: &str = "shared";

/// One remembered item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Lookup key, usually a task id
    pub key: String,
    /// Searchable text
    pub content: String,
    /// Arbitrary metadata
    pub metadata: Value,
    /// Term frequencies of `content`
    pub terms: HashMap<String, f64>,
    /// Storage time
    pub created_at: DateTime<Utc>,
    /// Number of times the entry was returned by `get`
    pub access_count: u64,
}

/// Search hit
#[derive(Debug, Clone)]
pub struct MemoryMatch {
    /// Partition the entry lives in
    pub partition: String,
    /// The entry
    pub entry: MemoryEntry,
    /// Cosine similarity in [0, 1]
    pub score: f64,
}

/// Serializable copy of every partition, least recently used first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub partitions: HashMap<String, Vec<MemoryEntry>>,
}

/// Per-agent and shared LRU memory
pub struct MemoryManager {
    partitions: DashMap<String, Mutex<LruCache<String, MemoryEntry>>>,
    agent_capacity: NonZeroUsize,
    shared_capacity: NonZeroUsize,
    min_similarity: f64,
}

impl MemoryManager {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            agent_capacity: NonZeroUsize::new(config.capacity_per_agent).unwrap_or(NonZeroUsize::MIN),
            shared_capacity: NonZeroUsize::new(config.shared_capacity).unwrap_or(NonZeroUsize::MIN),
            min_similarity: config.min_similarity,
        }
    }

    fn capacity_for(&self, partition: &str) -> NonZeroUsize {
        if partition == SHARED_PARTITION {
            self.shared_capacity
        } else {
            self.agent_capacity
        }
    }

    /// Stores an entry in `agent_id`'s partition, evicting the least recently
    /// used entry when full
    pub fn store(&self, agent_id: &str, key: &str, content: &str, metadata: Value) {
        let entry = MemoryEntry {
            key: key.to_string(),
            content: content.to_string(),
            metadata,
            terms: term_frequencies(content),
            created_at: Utc::now(),
            access_count: 0,
        };
        let capacity = self.capacity_for(agent_id);
        let partition = self
            .partitions
            .entry(agent_id.to_string())
            .or_insert_with(|| Mutex::new(LruCache::new(capacity)));
        let pushed = partition.lock().push(key.to_string(), entry);
        if let Some((evicted, _)) = pushed {
            if evicted != key {
                debug!(partition = agent_id, key = %evicted, "evicted memory entry");
            }
        }
    }

    /// Stores an entry every agent can find
    pub fn store_shared(&self, key: &str, content: &str, metadata: Value) {
        self.store(SHARED_PARTITION, key, content, metadata);
    }

    /// Fetches an entry, marking it recently used
    pub fn get(&self, agent_id: &str, key: &str) -> Option<MemoryEntry> {
        let partition = self.partitions.get(agent_id)?;
        let mut cache = partition.lock();
        let entry = cache.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.clone())
    }

    /// Entries of `agent_id` and the shared partition most similar to `query`
    pub fn search(&self, agent_id: &str, query: &str, limit: usize) -> Vec<MemoryMatch> {
        let query_terms = term_frequencies(query);
        if query_terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for name in [agent_id, SHARED_PARTITION] {
            let Some(partition) = self.partitions.get(name) else {
                continue;
            };
            let cache = partition.lock();
            for (_, entry) in cache.iter() {
                let score = cosine(&query_terms, &entry.terms);
                if score >= self.min_similarity {
                    matches.push(MemoryMatch {
                        partition: name.to_string(),
                        entry: entry.clone(),
                        score,
                    });
                }
            }
            if agent_id == SHARED_PARTITION {
                break;
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.key.cmp(&b.entry.key))
        });
        matches.truncate(limit);
        matches
    }

    /// Removes one entry
    pub fn forget(&self, agent_id: &str, key: &str) -> Option<MemoryEntry> {
        self.partitions.get(agent_id)?.lock().pop(key)
    }

    /// Drops an agent's whole partition
    pub fn clear_agent(&self, agent_id: &str) {
        self.partitions.remove(agent_id);
    }

    /// Number of entries in a partition
    pub fn len(&self, agent_id: &str) -> usize {
        self.partitions
            .get(agent_id)
            .map_or(0, |partition| partition.lock().len())
    }

    /// Copies every partition
    pub fn snapshot(&self) -> MemorySnapshot {
        let partitions = self
            .partitions
            .iter()
            .map(|partition| {
                let cache = partition.value().lock();
                // iter() yields most recent first; store oldest first so a
                // restore replays the same recency order
                let mut entries: Vec<MemoryEntry> = cache.iter().map(|(_, e)| e.clone()).collect();
                entries.reverse();
                (partition.key().clone(), entries)
            })
            .collect();
        MemorySnapshot { partitions }
    }

    /// Replaces the contents of every partition present in `snapshot`
    pub fn restore(&self, snapshot: MemorySnapshot) {
        for (name, entries) in snapshot.partitions {
            let mut cache = LruCache::new(self.capacity_for(&name));
            for entry in entries {
                cache.push(entry.key.clone(), entry);
            }
            self.partitions.insert(name, Mutex::new(cache));
        }
    }

    /// Writes a JSON snapshot to `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Restores a snapshot written by `save`; a missing file is not an error
    pub async fn load(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot: MemorySnapshot = serde_json::from_str(&content)?;
        self.restore(snapshot);
        Ok(true)
    }
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut terms = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        *terms.entry(word.to_lowercase()).or_insert(0.0) += 1.0;
    }
    terms
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let norm = |v: &HashMap<String, f64>| v.values().map(|w| w * w).sum::<f64>().sqrt();
    dot / (norm(a) * norm(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(capacity: usize) -> MemoryManager {
        MemoryManager::new(&MemoryConfig {
            capacity_per_agent: capacity,
            shared_capacity: capacity,
            min_similarity: 0.1,
        })
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let memory = manager(8);
        memory.store("a", "t1", "parse json config files", json!({}));
        memory.store("a", "t2", "benchmark async runtime", json!({}));
        memory.store_shared("t3", "json schema validation", json!({}));

        let hits = memory.search("a", "validate json config", 5);
        let keys: Vec<&str> = hits.iter().map(|m| m.entry.key.as_str()).collect();
        assert_eq!(keys, vec!["t1", "t3"]);
        assert_eq!(hits[1].partition, SHARED_PARTITION);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_partitions_are_private() {
        let memory = manager(8);
        memory.store("a", "t1", "secret roadmap", json!({}));
        assert!(memory.search("b", "secret roadmap", 5).is_empty());
        assert!(memory.get("b", "t1").is_none());
        assert_eq!(memory.get("a", "t1").unwrap().access_count, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let memory = manager(2);
        memory.store("a", "t1", "first entry", json!({}));
        memory.store("a", "t2", "second entry", json!({}));
        memory.get("a", "t1");
        memory.store("a", "t3", "third entry", json!({}));

        assert_eq!(memory.len("a"), 2);
        assert!(memory.get("a", "t2").is_none());
        assert!(memory.get("a", "t1").is_some());
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("memory.json");

        let memory = manager(4);
        memory.store("a", "t1", "rust ownership notes", json!({"quality": 0.9}));
        memory.save(&path).await?;

        let restored = manager(4);
        assert!(restored.load(&path).await?);
        assert_eq!(restored.len("a"), 1);
        assert_eq!(restored.get("a", "t1").unwrap().metadata["quality"], json!(0.9));
        assert!(!restored.load(&dir.path().join("missing.json")).await?);
        Ok(())
    }
}
