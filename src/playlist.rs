//! M3U playlist parser
//!
//! Single left-to-right scan over decoded lines, O(1) extra state per line,
//! so multi-megabyte playlists stream straight from the download.

use std::collections::HashSet;
use std::io::BufRead;

use crate::models::Channel;

/// Default group for channels without a usable `group-title`
pub const DEFAULT_GROUP: &str = "Uncategorized";

/// Parse result: deduplicated channels plus the guide URL the playlist
/// itself declared, if any
#[derive(Debug, Clone, Default)]
pub struct ParsedPlaylist {
    pub channels: Vec<Channel>,
    /// `x-tvg-url` / `url-tvg` from the `#EXTM3U` header
    pub guide_url: Option<String>,
}

/// Parse playlist text already held in memory
pub fn parse_str(content: &str) -> ParsedPlaylist {
    // Reading from a &str cannot fail
    parse_reader(content.as_bytes()).unwrap_or_default()
}

/// Streaming parse from any buffered reader.
///
/// A `#EXTINF:` line is held as pending metadata; the next non-comment,
/// non-blank line is its stream URL. Duplicate channel ids are dropped,
/// first occurrence wins.
pub fn parse_reader<R: BufRead>(reader: R) -> Result<ParsedPlaylist, String> {
    let mut playlist = ParsedPlaylist::default();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut pending_metadata: Option<String> = None;
    let mut first_line = true;

    for line in reader.lines() {
        let line = line.map_err(|e| format!("Read failed: {}", e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if first_line {
            first_line = false;
            if line.starts_with("#EXTM3U") {
                playlist.guide_url =
                    attribute(line, "x-tvg-url").or_else(|| attribute(line, "url-tvg"));
                continue;
            }
        }

        if line.starts_with("#EXTINF:") {
            pending_metadata = Some(line.to_string());
        } else if line.starts_with('#') {
            // Other directives (#EXTGRP, #EXTVLCOPT, comments) are ignored
        } else if let Some(channel) = build_channel(line, pending_metadata.take()) {
            if seen_ids.insert(channel.id.clone()) {
                playlist.channels.push(channel);
            }
        }
    }

    Ok(playlist)
}

fn build_channel(url: &str, metadata: Option<String>) -> Option<Channel> {
    let metadata = metadata.unwrap_or_default();

    let name = display_name(&metadata)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| url.to_string());
    let group = attribute(&metadata, "group-title")
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| DEFAULT_GROUP.to_string());
    let logo_url = attribute(&metadata, "tvg-logo").unwrap_or_default();
    let guide_id = attribute(&metadata, "tvg-id").filter(|id| !id.trim().is_empty());

    Some(Channel {
        id: Channel::derive_id(guide_id.as_deref(), url),
        name,
        group,
        logo_url,
        guide_id,
        raw_metadata: metadata,
    })
}

/// Channel display name: text after the last comma of the `#EXTINF:` line
fn display_name(metadata: &str) -> Option<String> {
    let comma = metadata.rfind(',')?;
    Some(metadata[comma + 1..].trim().to_string())
}

/// Bounded lookup of one `key="value"` attribute on a descriptor line.
///
/// Keys are matched case-insensitively; a missing attribute is simply
/// absent, never an error.
pub(crate) fn attribute(line: &str, name: &str) -> Option<String> {
    let needle = format!("{}=\"", name);
    let start = line
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))?;
    let rest = &line[start + needle.len()..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_playlist() {
        let content = r#"
#EXTM3U
#EXTINF:-1 tvg-id="cnn" group-title="News",CNN
http://example.com/live/user/pass/1.ts
#EXTINF:-1 tvg-id="bbc" group-title="News",BBC
http://example.com/live/user/pass/2.ts
"#;
        let playlist = parse_str(content);
        assert_eq!(playlist.channels.len(), 2);
        assert_eq!(playlist.channels[0].name, "CNN");
        assert_eq!(playlist.channels[0].group, "News");
        assert_eq!(playlist.channels[0].id, "epg:cnn");
    }

    #[test]
    fn test_duplicate_ids_first_occurrence_wins() {
        let content = r#"#EXTM3U
#EXTINF:-1 tvg-id="cnn" group-title="News",CNN
http://example.com/1.ts
#EXTINF:-1 tvg-id="CNN" group-title="Backup",CNN Mirror
http://example.com/2.ts
#EXTINF:-1,No Id
http://example.com/3.ts
#EXTINF:-1,No Id Again
http://example.com/3.ts
"#;
        let playlist = parse_str(content);
        assert_eq!(playlist.channels.len(), 2);
        assert_eq!(playlist.channels[0].name, "CNN");
        assert_eq!(playlist.channels[0].group, "News");
        assert_eq!(playlist.channels[1].id, "url:http://example.com/3.ts");
        assert_eq!(playlist.channels[1].name, "No Id");
    }

    #[test]
    fn test_missing_attributes_use_defaults() {
        let content = "#EXTINF:-1,Bare Channel\nhttp://example.com/bare.ts\n";
        let playlist = parse_str(content);
        let channel = &playlist.channels[0];
        assert_eq!(channel.group, DEFAULT_GROUP);
        assert_eq!(channel.logo_url, "");
        assert!(channel.guide_id.is_none());
        assert_eq!(channel.id, "url:http://example.com/bare.ts");
    }

    #[test]
    fn test_blank_group_falls_back_to_default() {
        let content = "#EXTINF:-1 group-title=\"  \",Channel\nhttp://example.com/1.ts\n";
        let playlist = parse_str(content);
        assert_eq!(playlist.channels[0].group, DEFAULT_GROUP);
    }

    #[test]
    fn test_url_without_metadata_still_yields_channel() {
        let content = "http://example.com/naked.ts\n";
        let playlist = parse_str(content);
        assert_eq!(playlist.channels.len(), 1);
        assert_eq!(playlist.channels[0].name, "http://example.com/naked.ts");
    }

    #[test]
    fn test_metadata_cleared_after_use() {
        let content = r#"#EXTINF:-1 group-title="News",CNN
http://example.com/1.ts
http://example.com/2.ts
"#;
        let playlist = parse_str(content);
        assert_eq!(playlist.channels.len(), 2);
        assert_eq!(playlist.channels[1].name, "http://example.com/2.ts");
        assert_eq!(playlist.channels[1].group, DEFAULT_GROUP);
    }

    #[test]
    fn test_header_guide_url_extraction() {
        let content = r#"#EXTM3U x-tvg-url="http://example.com/epg.xml.gz"
#EXTINF:-1 tvg-id="ch1" tvg-name="Channel One" group-title="General",Channel 1
http://example.com/1.ts
"#;
        let playlist = parse_str(content);
        assert_eq!(
            playlist.guide_url.as_deref(),
            Some("http://example.com/epg.xml.gz")
        );
        assert_eq!(
            attribute(&playlist.channels[0].raw_metadata, "tvg-name").as_deref(),
            Some("Channel One")
        );
    }

    #[test]
    fn test_attribute_lookup_is_case_insensitive() {
        let line = "#EXTINF:-1 TVG-ID=\"x\" Group-Title=\"News\",X";
        assert_eq!(attribute(line, "tvg-id").as_deref(), Some("x"));
        assert_eq!(attribute(line, "group-title").as_deref(), Some("News"));
        assert_eq!(attribute(line, "tvg-logo"), None);
    }

    #[test]
    fn test_other_directives_ignored() {
        let content = r#"#EXTM3U
#EXTINF:0,3sat
#EXTVLCOPT:network-caching=1000
rtsp://192.168.178.1:554/?avm=1&freq=450
"#;
        let playlist = parse_str(content);
        assert_eq!(playlist.channels.len(), 1);
        assert_eq!(playlist.channels[0].name, "3sat");
    }

    #[test]
    fn test_raw_metadata_retained_verbatim() {
        let line = "#EXTINF:-1 tvg-id=\"x\" tvg-name=\"X HD\" group-title=\"Misc\",X";
        let content = format!("{}\nhttp://example.com/x.ts\n", line);
        let playlist = parse_str(&content);
        assert_eq!(playlist.channels[0].raw_metadata, line);
    }
}
