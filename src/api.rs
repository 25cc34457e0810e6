//! Provider (Xtream Codes style) API client
//!
//! Providers expose category and live-stream listings as JSON under
//! `player_api.php`, keyed by the same credentials embedded in the
//! playlist URL. Synthesizing channels from those listings avoids the
//! multi-megabyte playlist download entirely when it works.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetch::Transport;
use crate::models::Channel;
use crate::playlist::DEFAULT_GROUP;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub category_id: String,
    pub category_name: String,
    #[serde(default)]
    pub parent_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStream {
    pub stream_id: i64,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub epg_channel_id: Option<String>,
    #[serde(default)]
    pub stream_icon: Option<String>,
}

pub struct ProviderClient<'a> {
    transport: &'a dyn Transport,
    base_url: String,
    username: String,
    password: String,
    user_agent: String,
}

impl<'a> ProviderClient<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        base_url: &str,
        username: &str,
        password: &str,
        user_agent: &str,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    fn api_url(&self, action: &str) -> String {
        format!(
            "{}/player_api.php?username={}&password={}&action={}",
            self.base_url, self.username, self.password, action
        )
    }

    fn get_body(&self, url: &str) -> Result<String, String> {
        let response = self.transport.get(url, &self.user_agent)?;
        if !(200..300).contains(&response.status) {
            return Err(format!("HTTP error: {}", response.status));
        }
        let mut body = String::new();
        let mut reader = response.body;
        reader
            .read_to_string(&mut body)
            .map_err(|e| format!("Read failed: {}", e))?;
        Ok(body)
    }

    pub fn get_live_categories(&self) -> Result<Vec<Category>, String> {
        let body = self.get_body(&self.api_url("get_live_categories"))?;
        serde_json::from_str(&body).map_err(|e| format!("Bad category response: {}", e))
    }

    pub fn get_live_streams(&self) -> Result<Vec<LiveStream>, String> {
        let body = self.get_body(&self.api_url("get_live_streams"))?;
        serde_json::from_str(&body).map_err(|e| format!("Bad stream response: {}", e))
    }

    /// Playback URL for one live stream
    pub fn stream_url(&self, stream_id: i64) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url, self.username, self.password, stream_id
        )
    }

    /// Fetch categories and live streams, join them on category id and
    /// synthesize one channel per stream. Streams whose category is
    /// unknown land in the default group.
    pub fn fetch_channels(&self) -> Result<Vec<Channel>, String> {
        let categories = self.get_live_categories()?;
        let streams = self.get_live_streams()?;
        debug!(
            "Provider API returned {} categories, {} streams",
            categories.len(),
            streams.len()
        );

        let mut channels = Vec::with_capacity(streams.len());
        let mut seen_ids = std::collections::HashSet::new();

        for stream in streams {
            let group = stream
                .category_id
                .as_deref()
                .and_then(|id| categories.iter().find(|c| c.category_id == id))
                .map(|c| c.category_name.clone())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string());

            let url = self.stream_url(stream.stream_id);
            let guide_id = stream
                .epg_channel_id
                .filter(|id| !id.trim().is_empty());
            let channel = Channel {
                id: Channel::derive_id(guide_id.as_deref(), &url),
                name: stream.name,
                group,
                logo_url: stream.stream_icon.unwrap_or_default(),
                guide_id,
                raw_metadata: String::new(),
            };
            if seen_ids.insert(channel.id.clone()) {
                channels.push(channel);
            }
        }

        Ok(channels)
    }
}
