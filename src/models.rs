//! Data models for the ingestion engine

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One playable entry from a playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identity: `epg:<normalized guide id>` when the playlist
    /// declared one, `url:<stream url>` otherwise
    pub id: String,
    pub name: String,
    pub group: String,
    pub logo_url: String,
    /// Raw guide-id attribute as declared by the playlist, matching hint only
    pub guide_id: Option<String>,
    /// Original descriptor line, kept so matching can recover extra hints
    pub raw_metadata: String,
}

impl Channel {
    /// Derive the stable channel id from the declared guide id or stream URL
    pub fn derive_id(guide_id: Option<&str>, stream_url: &str) -> String {
        match guide_id.map(|g| g.trim().to_lowercase()) {
            Some(g) if !g.is_empty() => format!("epg:{}", g),
            _ => format!("url:{}", stream_url),
        }
    }
}

/// A single broadcast slot from the guide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub title: String,
    pub description: Option<String>,
    /// Start time as Unix timestamp
    pub start_utc: i64,
    /// End time as Unix timestamp, always after `start_utc`
    pub end_utc: i64,
}

/// Currently airing and next scheduled program for one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NowNext {
    pub now: Option<Program>,
    pub next: Option<Program>,
}

impl NowNext {
    /// Fold one guide entry into the projection, relative to `eval_ts`.
    ///
    /// Among overlapping live entries the latest start wins; among upcoming
    /// entries the earliest start wins.
    pub fn consider(&mut self, program: Program, eval_ts: i64) {
        if program.start_utc <= eval_ts && eval_ts < program.end_utc {
            if self
                .now
                .as_ref()
                .is_none_or(|cur| program.start_utc > cur.start_utc)
            {
                self.now = Some(program);
            }
        } else if program.start_utc > eval_ts
            && self
                .next
                .as_ref()
                .is_none_or(|cur| program.start_utc < cur.start_utc)
        {
            self.next = Some(program);
        }
    }
}

/// Channels of one playlist group, in first-seen order
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelGroup {
    pub name: String,
    pub channels: Vec<Channel>,
}

/// The unit returned to callers; immutable once constructed
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub channels: Vec<Channel>,
    pub grouped: Vec<ChannelGroup>,
    pub now_next: HashMap<String, NowNext>,
    pub favorite_groups: Vec<String>,
    pub guide_warning: Option<String>,
    pub loaded_at: i64,
}

impl Snapshot {
    pub fn build(
        channels: Vec<Channel>,
        now_next: HashMap<String, NowNext>,
        favorite_groups: Vec<String>,
        guide_warning: Option<String>,
        loaded_at: i64,
    ) -> Self {
        let grouped = group_channels(&channels);
        Self {
            channels,
            grouped,
            now_next,
            favorite_groups,
            guide_warning,
            loaded_at,
        }
    }

    pub fn empty(favorite_groups: Vec<String>, loaded_at: i64) -> Self {
        Self::build(Vec::new(), HashMap::new(), favorite_groups, None, loaded_at)
    }
}

/// Group channels by their playlist group, sorted case-insensitively by name
fn group_channels(channels: &[Channel]) -> Vec<ChannelGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut by_group: HashMap<String, Vec<Channel>> = HashMap::new();

    for channel in channels {
        if !by_group.contains_key(&channel.group) {
            order.push(channel.group.clone());
        }
        by_group
            .entry(channel.group.clone())
            .or_default()
            .push(channel.clone());
    }

    order.sort_by_key(|name| name.to_lowercase());
    order
        .into_iter()
        .map(|name| {
            let channels = by_group.remove(&name).unwrap_or_default();
            ChannelGroup { name, channels }
        })
        .collect()
}

/// Persisted form of one load, keyed on disk by profile id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub channels: Vec<Channel>,
    pub now_next: HashMap<String, NowNext>,
    pub loaded_at: i64,
    pub config_signature: String,
}
