//! Channel matching index
//!
//! Guide feeds and playlists rarely agree on channel identity: the guide
//! says `ESPN HD` or `espn.us`, the playlist says `ESPN` with a stray
//! `tvg-name`. The index registers every known spelling of every playlist
//! channel under three normalizing transforms so guide-side lookups can
//! try progressively looser keys.

use std::collections::HashMap;

use crate::models::Channel;
use crate::playlist;

/// Quality and codec suffixes that providers append to channel names
const QUALITY_TOKENS: &[&str] = &[
    "hd", "fhd", "uhd", "sd", "4k", "8k", "hevc", "h264", "h265", "x264", "x265",
];

/// Lowercased, trimmed
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Alphanumeric characters only, lowercased
pub fn loose(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Loose form with quality tokens stripped: `"ESPN HD"` -> `"espn"`
pub fn bare(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty() && !QUALITY_TOKENS.contains(word))
        .collect()
}

/// Lookup table from normalized key to channel id; first registrant wins
pub struct MatchingIndex {
    keys: HashMap<String, String>,
}

impl MatchingIndex {
    /// Build the index once per parse from the full channel set.
    ///
    /// For each channel the name, the declared guide id and the `tvg-name`
    /// hint recovered from the raw descriptor line are registered under
    /// all three transforms.
    pub fn build(channels: &[Channel]) -> Self {
        let mut index = Self {
            keys: HashMap::new(),
        };

        for channel in channels {
            index.register(&channel.name, &channel.id);
            if let Some(guide_id) = &channel.guide_id {
                index.register(guide_id, &channel.id);
            }
            if let Some(hint) = playlist::attribute(&channel.raw_metadata, "tvg-name") {
                index.register(&hint, &channel.id);
            }
        }

        index
    }

    fn register(&mut self, tag: &str, channel_id: &str) {
        for key in [normalize(tag), loose(tag), bare(tag)] {
            if !key.is_empty() {
                self.keys
                    .entry(key)
                    .or_insert_with(|| channel_id.to_string());
            }
        }
    }

    /// Resolve a guide channel to a playlist channel id: the declared id
    /// through all three transforms first, then every alias the guide
    /// advertised for it.
    pub fn resolve(&self, declared_id: &str, aliases: &[String]) -> Option<&str> {
        std::iter::once(declared_id)
            .chain(aliases.iter().map(|s| s.as_str()))
            .find_map(|tag| self.lookup(tag))
    }

    fn lookup(&self, tag: &str) -> Option<&str> {
        for key in [normalize(tag), loose(tag), bare(tag)] {
            if key.is_empty() {
                continue;
            }
            if let Some(id) = self.keys.get(&key) {
                return Some(id);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
