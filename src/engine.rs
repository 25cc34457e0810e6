//! Cache lifecycle manager, the entry point the application calls
//!
//! One engine instance owns the in-memory channel/guide caches and the
//! per-profile disk records. All mutating operations are serialized behind
//! a single mutex so overlapping callers never race on shared state; the
//! expectation is that callers run loads on a background worker thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api::ProviderClient;
use crate::cache::{config_signature, CacheStore};
use crate::epg::{self, MatchingIndex};
use crate::error::EngineError;
use crate::fetch::{self, report, FetchConfig, ProgressCallback, Transport, UreqTransport};
use crate::models::{Channel, NowNext, Snapshot};
use crate::playlist::ParsedPlaylist;
use crate::provider::{self, GuideCandidate, PlaylistSource};

/// Channels older than this are re-acquired on the next load
const PLAYLIST_STALE_SECS: i64 = 24 * 60 * 60;
/// After an empty guide resolution, don't hammer the provider again for
/// this long; providers without a guide would otherwise be hit every load
const EMPTY_GUIDE_RETRY_SECS: i64 = 20 * 60;

/// Engine-facing view of the user configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub playlist_url: String,
    pub guide_url: String,
    pub favorite_groups: Vec<String>,
}

/// Supplies and persists the user configuration; blank strings mean unset
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> EngineSettings;
    fn save(&self, settings: &EngineSettings);
    fn clear(&self);
}

/// Supplies the active profile id, used for cache ownership and disk keying
pub trait ProfileSource: Send + Sync {
    fn active_profile(&self) -> String;
}

#[derive(Default)]
struct EngineState {
    /// `(profile id, config signature)` the caches belong to
    owner: Option<(String, String)>,
    channels: Vec<Channel>,
    channels_loaded_at: i64,
    now_next: HashMap<String, NowNext>,
    guide_loaded: bool,
    /// When the last guide resolution came back empty; 0 = never attempted
    last_empty_guide_attempt: i64,
    /// Derived guide URL that worked last time, tried first on the next pass
    derived_guide_url: Option<String>,
    /// `x-tvg-url` the playlist itself declared, if any
    playlist_guide_url: Option<String>,
}

pub struct Engine {
    config: Arc<dyn ConfigSource>,
    profiles: Arc<dyn ProfileSource>,
    transport: Arc<dyn Transport>,
    store: CacheStore,
    fetch: FetchConfig,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: Arc<dyn ConfigSource>, profiles: Arc<dyn ProfileSource>) -> Self {
        Self::with_parts(
            config,
            profiles,
            Arc::new(UreqTransport::new()),
            CacheStore::open_default(),
            FetchConfig::default(),
        )
    }

    pub fn with_parts(
        config: Arc<dyn ConfigSource>,
        profiles: Arc<dyn ProfileSource>,
        transport: Arc<dyn Transport>,
        store: CacheStore,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            config,
            profiles,
            transport,
            store,
            fetch,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Produce the current channel snapshot, serving memory and disk caches
    /// where possible and re-acquiring what is stale or forced.
    ///
    /// Only playlist acquisition can fail this call; guide problems are
    /// surfaced as `Snapshot::guide_warning`.
    pub fn load_snapshot(
        &self,
        force_playlist: bool,
        force_guide: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<Snapshot, EngineError> {
        let settings = self.config.load();
        let profile = self.profiles.active_profile();
        let playlist_url = settings.playlist_url.trim().to_string();
        let guide_url = settings.guide_url.trim().to_string();
        let signature = config_signature(&playlist_url, &guide_url);
        let now = Utc::now().timestamp();

        let mut state = self.state.lock().unwrap();
        self.establish_ownership(&mut state, &profile, &signature);

        if playlist_url.is_empty() {
            debug!("No playlist URL configured, returning empty snapshot");
            return Ok(Snapshot::empty(settings.favorite_groups, now));
        }

        // Hydrate memory from disk before deciding what is stale
        let mut disk_had_record = false;
        if state.channels.is_empty() {
            if let Some(record) = self.store.load(&profile, &signature) {
                info!(
                    "Hydrated {} channels from disk cache for profile {}",
                    record.channels.len(),
                    profile
                );
                state.channels = record.channels;
                state.now_next = record.now_next;
                state.channels_loaded_at = record.loaded_at;
                state.guide_loaded = !state.now_next.is_empty();
                disk_had_record = true;
            }
        } else {
            disk_had_record = true;
        }

        // Playlist: memory, unless forced or older than a day
        let playlist_fresh = !state.channels.is_empty()
            && !force_playlist
            && now - state.channels_loaded_at < PLAYLIST_STALE_SECS;
        let mut playlist_reloaded = false;
        if !playlist_fresh {
            let parsed = self.acquire_playlist(&playlist_url, &progress)?;
            info!("Acquired {} channels", parsed.channels.len());
            state.channels = parsed.channels;
            state.playlist_guide_url = parsed.guide_url;
            state.channels_loaded_at = now;
            playlist_reloaded = true;
        }

        // Guide: memory unless forced; empty results are retried at most
        // every 20 minutes
        let mut guide_warning = None;
        let mut guide_refreshed = false;
        if force_guide || !state.guide_loaded {
            let throttled = !force_guide
                && state.last_empty_guide_attempt != 0
                && now - state.last_empty_guide_attempt < EMPTY_GUIDE_RETRY_SECS;
            if throttled {
                debug!("Skipping guide resolution, last empty attempt was recent");
            } else {
                let candidates = self.assemble_guide_candidates(&guide_url, &playlist_url, &state);
                if !candidates.is_empty() {
                    let outcome = self.resolve_guide(&candidates, &state.channels, now, &progress);
                    match outcome {
                        GuideOutcome::Resolved { now_next, candidate } => {
                            info!("Guide resolved with {} channel schedules", now_next.len());
                            state.now_next = now_next;
                            state.guide_loaded = true;
                            state.last_empty_guide_attempt = 0;
                            if candidate.derived {
                                state.derived_guide_url = Some(candidate.url);
                            }
                            guide_refreshed = true;
                        }
                        GuideOutcome::Empty => {
                            debug!("All guide candidates resolved to an empty schedule");
                            state.now_next = HashMap::new();
                            state.guide_loaded = false;
                            state.last_empty_guide_attempt = now;
                        }
                        GuideOutcome::Failed(message) => {
                            warn!("Guide unavailable: {}", message);
                            state.now_next = HashMap::new();
                            state.guide_loaded = false;
                            state.last_empty_guide_attempt = now;
                            guide_warning = Some(message);
                        }
                    }
                }
            }
        }

        if playlist_reloaded || !disk_had_record || guide_refreshed {
            self.store.save(
                &profile,
                &crate::models::CacheRecord {
                    channels: state.channels.clone(),
                    now_next: state.now_next.clone(),
                    loaded_at: state.channels_loaded_at,
                    config_signature: signature,
                },
            );
        }

        report(&progress, "Ready", Some(100));
        Ok(Snapshot::build(
            state.channels.clone(),
            state.now_next.clone(),
            settings.favorite_groups,
            guide_warning,
            state.channels_loaded_at,
        ))
    }

    /// Hydrate memory strictly from the disk record. Never touches the
    /// network, safe to run eagerly at process start.
    pub fn warmup_from_cache_only(&self) {
        let settings = self.config.load();
        let profile = self.profiles.active_profile();
        let playlist_url = settings.playlist_url.trim();
        let signature = config_signature(playlist_url, settings.guide_url.trim());

        let mut state = self.state.lock().unwrap();
        self.establish_ownership(&mut state, &profile, &signature);
        if playlist_url.is_empty() || !state.channels.is_empty() {
            return;
        }
        if let Some(record) = self.store.load(&profile, &signature) {
            info!(
                "Warm start: {} channels from disk for profile {}",
                record.channels.len(),
                profile
            );
            state.channels = record.channels;
            state.now_next = record.now_next;
            state.channels_loaded_at = record.loaded_at;
            state.guide_loaded = !state.now_next.is_empty();
        }
    }

    /// Whether a snapshot has outlived the playlist staleness window
    pub fn is_snapshot_stale(&self, snapshot: &Snapshot) -> bool {
        Utc::now().timestamp() - snapshot.loaded_at > PLAYLIST_STALE_SECS
    }

    /// Drop all in-memory caches and the current profile's disk record
    pub fn invalidate_cache(&self) {
        let profile = self.profiles.active_profile();
        let mut state = self.state.lock().unwrap();
        self.store.remove(&profile);
        *state = EngineState::default();
        info!("Cache invalidated for profile {}", profile);
    }

    /// Toggle a group in the ordered favorites list held by the
    /// configuration source
    pub fn toggle_favorite_group(&self, group: &str) {
        let _guard = self.state.lock().unwrap();
        let mut settings = self.config.load();
        match settings.favorite_groups.iter().position(|g| g == group) {
            Some(i) => {
                settings.favorite_groups.remove(i);
            }
            None => settings.favorite_groups.push(group.to_string()),
        }
        self.config.save(&settings);
    }

    fn establish_ownership(&self, state: &mut EngineState, profile: &str, signature: &str) {
        let current = (profile.to_string(), signature.to_string());
        if state.owner.as_ref() != Some(&current) {
            if state.owner.is_some() {
                debug!("Owner changed, dropping in-memory caches");
            }
            *state = EngineState::default();
            state.owner = Some(current);
        }
    }

    /// Provider API first when the URL carries credentials, generic
    /// download with retries otherwise or as fallback
    fn acquire_playlist(
        &self,
        playlist_url: &str,
        progress: &Option<ProgressCallback>,
    ) -> Result<ParsedPlaylist, EngineError> {
        if let PlaylistSource::ProviderApi {
            base_url,
            username,
            password,
        } = provider::detect_source(playlist_url)
        {
            report(progress, "Contacting provider API", None);
            let client = ProviderClient::new(
                self.transport.as_ref(),
                &base_url,
                &username,
                &password,
                &self.fetch.user_agent,
            );
            match client.fetch_channels() {
                Ok(channels) if !channels.is_empty() => {
                    return Ok(ParsedPlaylist {
                        channels,
                        guide_url: None,
                    });
                }
                Ok(_) => warn!("Provider API returned no channels, trying playlist download"),
                Err(e) => warn!("Provider API failed ({}), trying playlist download", e),
            }
        }

        fetch::download_playlist(
            self.transport.as_ref(),
            playlist_url,
            &self.fetch,
            progress,
            &|delay: Duration| std::thread::sleep(delay),
        )
    }

    /// Configured URL wins outright; otherwise the playlist-declared guide
    /// URL, then provider-derived shapes
    fn assemble_guide_candidates(
        &self,
        guide_url: &str,
        playlist_url: &str,
        state: &EngineState,
    ) -> Vec<GuideCandidate> {
        if !guide_url.is_empty() {
            return vec![GuideCandidate {
                url: guide_url.to_string(),
                derived: false,
            }];
        }

        let mut candidates = Vec::new();
        if let Some(url) = &state.playlist_guide_url {
            candidates.push(GuideCandidate {
                url: url.clone(),
                derived: false,
            });
        }
        let source = provider::detect_source(playlist_url);
        for candidate in provider::guide_candidates(&source, state.derived_guide_url.as_deref()) {
            if candidates.iter().all(|c| c.url != candidate.url) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// Try candidates in order, each attempt independent, stopping at the
    /// first non-empty schedule. The last candidate's result stands even
    /// when empty so the pass terminates deterministically.
    fn resolve_guide(
        &self,
        candidates: &[GuideCandidate],
        channels: &[Channel],
        eval_ts: i64,
        progress: &Option<ProgressCallback>,
    ) -> GuideOutcome {
        let index = MatchingIndex::build(channels);
        let mut last_attempt: Option<Result<(), String>> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            report(progress, "Loading guide", None);
            debug!(
                "Guide candidate {}/{}: {}",
                i + 1,
                candidates.len(),
                candidate.url
            );

            let attempt = fetch::open_guide_stream(
                self.transport.as_ref(),
                &candidate.url,
                &self.fetch.user_agent,
            )
            .and_then(|reader| epg::resolve_guide(reader, &index, eval_ts));

            match attempt {
                Ok(result) if !result.now_next.is_empty() => {
                    if result.error_count > 0 {
                        debug!("Guide parsed with {} tolerated XML errors", result.error_count);
                    }
                    return GuideOutcome::Resolved {
                        now_next: result.now_next,
                        candidate: candidate.clone(),
                    };
                }
                Ok(_) => last_attempt = Some(Ok(())),
                Err(e) => {
                    debug!("Guide candidate failed: {}", e);
                    last_attempt = Some(Err(e));
                }
            }
        }

        match last_attempt {
            Some(Err(message)) => GuideOutcome::Failed(message),
            _ => GuideOutcome::Empty,
        }
    }
}

enum GuideOutcome {
    Resolved {
        now_next: HashMap<String, NowNext>,
        candidate: GuideCandidate,
    },
    Empty,
    Failed(String),
}
