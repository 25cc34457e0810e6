//! On-disk snapshot cache
//!
//! One JSON record per profile under the platform cache directory.
//! Records carry the configuration signature they were built from; a
//! mismatching or empty record is treated as absent.

use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::CacheRecord;

/// Deterministic hash of the normalized playlist + guide URLs, used to
/// detect when a cached record no longer matches the active configuration
pub fn config_signature(playlist_url: &str, guide_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(playlist_url.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(guide_url.trim().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Store under the platform cache directory
    pub fn open_default() -> Self {
        let mut root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        root.push("iptv-core");
        Self { root }
    }

    /// Store rooted at an explicit directory
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    fn record_path(&self, profile: &str) -> PathBuf {
        let safe: String = profile
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.root.join(format!("channels-{}.json", safe))
    }

    /// Load the record for `profile` if it exists, matches `signature` and
    /// actually contains channels
    pub fn load(&self, profile: &str, signature: &str) -> Option<CacheRecord> {
        let path = self.record_path(profile);
        let content = fs::read_to_string(&path).ok()?;
        let record: CacheRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding unreadable cache record {:?}: {}", path, e);
                return None;
            }
        };

        if record.config_signature != signature {
            debug!("Cache record {:?} has a stale config signature", path);
            return None;
        }
        if record.channels.is_empty() {
            return None;
        }
        Some(record)
    }

    /// Persist the record; failures are logged and swallowed, a cache that
    /// cannot be written only costs the next startup a refetch
    pub fn save(&self, profile: &str, record: &CacheRecord) {
        if let Err(e) = fs::create_dir_all(&self.root) {
            warn!("Cannot create cache directory {:?}: {}", self.root, e);
            return;
        }
        let path = self.record_path(profile);
        match serde_json::to_string(record) {
            Ok(content) => {
                if let Err(e) = fs::write(&path, content) {
                    warn!("Cannot write cache record {:?}: {}", path, e);
                } else {
                    debug!("Persisted {} channels to {:?}", record.channels.len(), path);
                }
            }
            Err(e) => warn!("Cannot serialize cache record: {}", e),
        }
    }

    pub fn remove(&self, profile: &str) {
        let _ = fs::remove_file(self.record_path(profile));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use std::collections::HashMap;

    fn record(signature: &str, channel_count: usize) -> CacheRecord {
        let channels = (0..channel_count)
            .map(|i| Channel {
                id: format!("url:http://example.com/{}.ts", i),
                name: format!("Channel {}", i),
                group: "Test".to_string(),
                logo_url: String::new(),
                guide_id: None,
                raw_metadata: String::new(),
            })
            .collect();
        CacheRecord {
            channels,
            now_next: HashMap::new(),
            loaded_at: 1700000000,
            config_signature: signature.to_string(),
        }
    }

    #[test]
    fn test_signature_deterministic_and_sensitive() {
        let a = config_signature("http://example.com/p.m3u", "http://example.com/epg.xml");
        let b = config_signature("http://example.com/p.m3u", "http://example.com/epg.xml");
        let c = config_signature("http://example.com/p.m3u", "http://other.com/epg.xml");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Surrounding whitespace is normalized away
        assert_eq!(
            a,
            config_signature(" http://example.com/p.m3u ", "http://example.com/epg.xml\n")
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_root(dir.path().to_path_buf());
        let rec = record("sig-a", 3);

        store.save("profile-1", &rec);
        let loaded = store.load("profile-1", "sig-a").unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn test_signature_mismatch_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_root(dir.path().to_path_buf());
        store.save("profile-1", &record("sig-a", 3));

        assert!(store.load("profile-1", "sig-b").is_none());
    }

    #[test]
    fn test_empty_record_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_root(dir.path().to_path_buf());
        store.save("profile-1", &record("sig-a", 0));

        assert!(store.load("profile-1", "sig-a").is_none());
    }

    #[test]
    fn test_profiles_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_root(dir.path().to_path_buf());
        store.save("alice", &record("sig-a", 1));
        store.save("bob", &record("sig-b", 2));

        assert_eq!(store.load("alice", "sig-a").unwrap().channels.len(), 1);
        assert_eq!(store.load("bob", "sig-b").unwrap().channels.len(), 2);

        store.remove("alice");
        assert!(store.load("alice", "sig-a").is_none());
        assert!(store.load("bob", "sig-b").is_some());
    }

    #[test]
    fn test_garbage_file_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_root(dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("channels-p.json"), "not json").unwrap();

        assert!(store.load("p", "sig").is_none());
    }
}
