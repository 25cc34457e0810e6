//! Playlist source detection and guide-URL derivation
//!
//! Provider portals hand out playlist URLs of the shape
//! `http://host/get.php?username=U&password=P&type=m3u_plus`. Those carry
//! enough to talk to the provider's JSON API directly and to guess where
//! its XMLTV guide lives when none is configured.

use std::collections::HashMap;

/// Classification of a user-supplied playlist URL
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistSource {
    /// Plain playlist endpoint, fetched as-is
    Generic,
    /// Provider portal with embedded credentials
    ProviderApi {
        base_url: String,
        username: String,
        password: String,
    },
}

/// One guide-URL candidate, in the order it should be attempted
#[derive(Debug, Clone, PartialEq)]
pub struct GuideCandidate {
    pub url: String,
    /// Derived from provider credentials rather than configured; successful
    /// derived URLs are remembered for the next load
    pub derived: bool,
}

/// Inspect a playlist URL and decide how to acquire it.
///
/// A URL counts as a provider portal when its path ends in `get.php` and
/// both `username` and `password` query parameters are non-blank.
pub fn detect_source(url: &str) -> PlaylistSource {
    let url = url.trim();
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url, ""),
    };

    if !path.ends_with("/get.php") {
        return PlaylistSource::Generic;
    }

    let params = parse_query(query);
    let username = params.get("username").map(|s| s.trim()).unwrap_or("");
    let password = params.get("password").map(|s| s.trim()).unwrap_or("");
    if username.is_empty() || password.is_empty() {
        return PlaylistSource::Generic;
    }

    match base_url(url) {
        Some(base) => PlaylistSource::ProviderApi {
            base_url: base,
            username: username.to_string(),
            password: password.to_string(),
        },
        None => PlaylistSource::Generic,
    }
}

/// Ordered guide-URL candidates for a provider source.
///
/// Providers are not self-describing about guide availability, so several
/// endpoint shapes are tried: a previously successful derived URL first
/// (if it still belongs to this server), then the canonical `xmltv.php`
/// endpoint, then two shapes seen on older panels.
pub fn guide_candidates(source: &PlaylistSource, remembered: Option<&str>) -> Vec<GuideCandidate> {
    let PlaylistSource::ProviderApi {
        base_url,
        username,
        password,
    } = source
    else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    if let Some(remembered) = remembered {
        if remembered.starts_with(base_url.as_str()) {
            candidates.push(GuideCandidate {
                url: remembered.to_string(),
                derived: true,
            });
        }
    }

    for url in [
        format!("{}/xmltv.php?username={}&password={}", base_url, username, password),
        format!("{}/epg.php?username={}&password={}", base_url, username, password),
        format!("{}/get.php?username={}&password={}&type=epg", base_url, username, password),
    ] {
        if candidates.iter().all(|c| c.url != url) {
            candidates.push(GuideCandidate { url, derived: true });
        }
    }

    candidates
}

/// Extract `scheme://host[:port]` from a URL
fn base_url(url: &str) -> Option<String> {
    let proto_end = url.find("://")?;
    let rest = &url[proto_end + 3..];
    match rest.find('/') {
        Some(path_start) => Some(url[..proto_end + 3 + path_start].to_string()),
        None => Some(url.split('?').next().unwrap_or(url).to_string()),
    }
}

fn parse_query(query: &str) -> HashMap<&str, &str> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(key, value);
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_provider_url() {
        let source =
            detect_source("http://tv.example.com:8080/get.php?username=john&password=secret&type=m3u_plus");
        assert_eq!(
            source,
            PlaylistSource::ProviderApi {
                base_url: "http://tv.example.com:8080".to_string(),
                username: "john".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn test_detect_generic_urls() {
        // Wrong filename
        assert_eq!(
            detect_source("http://example.com/playlist.m3u8"),
            PlaylistSource::Generic
        );
        // Right filename, blank credentials
        assert_eq!(
            detect_source("http://example.com/get.php?username=&password=x"),
            PlaylistSource::Generic
        );
        assert_eq!(
            detect_source("http://example.com/get.php?type=m3u_plus"),
            PlaylistSource::Generic
        );
    }

    #[test]
    fn test_candidate_order_without_memory() {
        let source = detect_source("http://srv/get.php?username=u&password=p");
        let candidates = guide_candidates(&source, None);
        let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://srv/xmltv.php?username=u&password=p",
                "http://srv/epg.php?username=u&password=p",
                "http://srv/get.php?username=u&password=p&type=epg",
            ]
        );
    }

    #[test]
    fn test_remembered_candidate_comes_first() {
        let source = detect_source("http://srv/get.php?username=u&password=p");
        let candidates = guide_candidates(&source, Some("http://srv/epg.php?username=u&password=p"));
        assert_eq!(candidates[0].url, "http://srv/epg.php?username=u&password=p");
        // No duplicate of the remembered shape later in the list
        assert_eq!(
            candidates
                .iter()
                .filter(|c| c.url.ends_with("/epg.php?username=u&password=p"))
                .count(),
            1
        );
    }

    #[test]
    fn test_remembered_candidate_dropped_on_server_change() {
        let source = detect_source("http://new-srv/get.php?username=u&password=p");
        let candidates = guide_candidates(&source, Some("http://old-srv/xmltv.php?username=u&password=p"));
        assert!(candidates.iter().all(|c| c.url.starts_with("http://new-srv/")));
    }

    #[test]
    fn test_no_candidates_for_generic_source() {
        assert!(guide_candidates(&PlaylistSource::Generic, None).is_empty());
    }
}
