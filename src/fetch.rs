//! HTTP acquisition: transport abstraction, retrying playlist download,
//! transparent gzip and coarse progress reporting
//!
//! Bodies are streamed into the parsers; nothing buffers a whole download
//! before parsing starts.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::playlist::{self, ParsedPlaylist};

/// Progress callback: human-readable message plus percentage when the
/// content length is known. Percentages are monotonically non-decreasing
/// within one operation.
pub type ProgressCallback = Box<dyn Fn(&str, Option<u8>) + Send>;

pub(crate) fn report(progress: &Option<ProgressCallback>, message: &str, percent: Option<u8>) {
    if let Some(cb) = progress {
        cb(message, percent);
    }
}

/// Response surface the engine needs from any HTTP GET capability
pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Minimal GET transport; production uses [`UreqTransport`], tests script
/// their own
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, user_agent: &str) -> Result<TransportResponse, String>;
}

/// `ureq`-backed transport with the agent configuration used throughout
/// the app: long read timeout for multi-megabyte playlists, shorter
/// connect timeout
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(120)))
            .timeout_connect(Some(Duration::from_secs(30)))
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn get(&self, url: &str, user_agent: &str) -> Result<TransportResponse, String> {
        let response = self
            .agent
            .get(url)
            .header("User-Agent", user_agent)
            .call()
            .map_err(|e| format!("Request failed: {}", e))?;

        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());

        Ok(TransportResponse {
            status,
            content_length,
            body: Box::new(response.into_body().into_reader()),
        })
    }
}

/// Download policy for the generic playlist path
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Total attempts before the load fails
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Sent on every request; a player-style agent keeps providers from
    /// rejecting the client
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
        }
    }
}

/// Backoff before the retry following failure number `failures` (1-based):
/// 2s, 4s, 8s, 8s, ...
pub fn backoff_delay(config: &FetchConfig, failures: u32) -> Duration {
    let doubled = config
        .base_delay
        .saturating_mul(1u32 << (failures.saturating_sub(1)).min(16));
    doubled.min(config.max_delay)
}

/// Download and parse the playlist with bounded retries.
///
/// Both a non-success HTTP status and a zero-channel parse are retryable;
/// the last diagnostic is carried into the final error.
pub fn download_playlist(
    transport: &dyn Transport,
    url: &str,
    config: &FetchConfig,
    progress: &Option<ProgressCallback>,
    sleep: &dyn Fn(Duration),
) -> Result<ParsedPlaylist, EngineError> {
    let mut last_error = String::new();

    for attempt in 1..=config.max_attempts {
        debug!("Playlist download attempt {}/{}", attempt, config.max_attempts);
        match try_download(transport, url, config, progress) {
            Ok(parsed) if !parsed.channels.is_empty() => {
                debug!("Parsed {} channels from {}", parsed.channels.len(), url);
                report(progress, "Playlist downloaded", Some(100));
                return Ok(parsed);
            }
            Ok(_) => {
                last_error = "playlist parsed to zero channels".to_string();
                warn!("Attempt {} returned an empty playlist", attempt);
            }
            Err(e) => {
                warn!("Attempt {} failed: {}", attempt, e);
                last_error = e;
            }
        }

        if attempt < config.max_attempts {
            sleep(backoff_delay(config, attempt));
        }
    }

    Err(EngineError::AcquisitionFailed {
        attempts: config.max_attempts,
        message: last_error,
    })
}

fn try_download(
    transport: &dyn Transport,
    url: &str,
    config: &FetchConfig,
    progress: &Option<ProgressCallback>,
) -> Result<ParsedPlaylist, String> {
    report(progress, "Downloading playlist", None);
    let reader = open_stream(
        transport,
        url,
        &config.user_agent,
        progress.as_ref(),
        "Downloading playlist",
    )?;
    playlist::parse_reader(reader)
}

/// Single guide-candidate fetch; no retries, callers iterate candidates
pub fn open_guide_stream(
    transport: &dyn Transport,
    url: &str,
    user_agent: &str,
) -> Result<Box<dyn BufRead>, String> {
    open_stream(transport, url, user_agent, None, "Loading guide")
}

/// GET `url`, verify the status, wire up progress counting and transparent
/// gzip, and hand back a buffered reader positioned at the payload.
fn open_stream<'a>(
    transport: &dyn Transport,
    url: &str,
    user_agent: &str,
    progress: Option<&'a ProgressCallback>,
    stage: &str,
) -> Result<Box<dyn BufRead + 'a>, String> {
    let response = transport.get(url, user_agent)?;
    if !(200..300).contains(&response.status) {
        return Err(format!("HTTP error: {}", response.status));
    }

    let mut counted = ProgressReader::new(
        response.body,
        response.content_length,
        progress.map(|cb| (stage.to_string(), cb)),
    );

    // Gzip detection: URL suffix first, then the 1f 8b magic bytes
    if url.split('?').next().unwrap_or(url).ends_with(".gz") {
        return Ok(Box::new(BufReader::with_capacity(
            64 * 1024,
            GzDecoder::new(counted),
        )));
    }

    let mut magic = [0u8; 2];
    let mut prefix_len = 0;
    while prefix_len < 2 {
        match counted.read(&mut magic[prefix_len..]) {
            Ok(0) => break,
            Ok(n) => prefix_len += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("Read failed: {}", e)),
        }
    }

    let rest = std::io::Cursor::new(magic[..prefix_len].to_vec()).chain(counted);
    if prefix_len == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(BufReader::with_capacity(
            64 * 1024,
            GzDecoder::new(rest),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(64 * 1024, rest)))
    }
}

/// Counts bytes as they stream by and emits coarse progress callbacks,
/// whole-percent steps when the total is known
struct ProgressReader<'a, R> {
    inner: R,
    total: Option<u64>,
    read: u64,
    last_percent: Option<u8>,
    last_indeterminate_mark: u64,
    progress: Option<(String, &'a ProgressCallback)>,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    fn new(inner: R, total: Option<u64>, progress: Option<(String, &'a ProgressCallback)>) -> Self {
        Self {
            inner,
            total,
            read: 0,
            last_percent: None,
            last_indeterminate_mark: 0,
            progress,
        }
    }

    fn emit(&mut self) {
        let Some((stage, cb)) = &self.progress else {
            return;
        };
        match self.total {
            Some(total) if total > 0 => {
                let percent = ((self.read * 100) / total).min(100) as u8;
                if self.last_percent != Some(percent) {
                    self.last_percent = Some(percent);
                    cb(stage, Some(percent));
                }
            }
            _ => {
                // No content length: tick roughly every megabyte
                if self.read - self.last_indeterminate_mark >= 1024 * 1024 {
                    self.last_indeterminate_mark = self.read;
                    cb(stage, None);
                }
            }
        }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        self.emit();
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::cell::RefCell;
    use std::io::Write;
    use std::sync::Mutex;

    /// Scripted transport: pops one canned response per request and counts
    /// how many were made
    pub(crate) struct ScriptedTransport {
        responses: Mutex<Vec<Result<(u16, Option<u64>, Vec<u8>), String>>>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            mut responses: Vec<Result<(u16, Option<u64>, Vec<u8>), String>>,
        ) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, url: &str, _user_agent: &str) -> Result<TransportResponse, String> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.responses.lock().unwrap().pop() {
                Some(Ok((status, content_length, body))) => Ok(TransportResponse {
                    status,
                    content_length,
                    body: Box::new(std::io::Cursor::new(body)),
                }),
                Some(Err(e)) => Err(e),
                None => Err("no scripted response left".to_string()),
            }
        }
    }

    const PLAYLIST: &str = "#EXTM3U\n#EXTINF:-1 tvg-id=\"cnn\",CNN\nhttp://example.com/1.ts\n";

    fn no_sleep() -> impl Fn(Duration) {
        |_| {}
    }

    #[test]
    fn test_backoff_schedule_caps_at_max() {
        let config = FetchConfig::default();
        let delays: Vec<u64> = (1..=4)
            .map(|n| backoff_delay(&config, n).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 8]);
    }

    #[test]
    fn test_download_succeeds_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok((
            200,
            Some(PLAYLIST.len() as u64),
            PLAYLIST.as_bytes().to_vec(),
        ))]);
        let parsed =
            download_playlist(&transport, "http://example.com/p.m3u", &FetchConfig::default(), &None, &no_sleep())
                .unwrap();
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_retry_exhaustion_makes_exactly_four_attempts() {
        let transport = ScriptedTransport::new(vec![
            Err("connection refused".to_string()),
            Ok((503, None, Vec::new())),
            Ok((200, None, b"#EXTM3U\n".to_vec())), // parses to zero channels
            Err("connection reset".to_string()),
        ]);
        let recorded: RefCell<Vec<Duration>> = RefCell::new(Vec::new());
        let sleep = |d: Duration| recorded.borrow_mut().push(d);

        let err = download_playlist(
            &transport,
            "http://example.com/p.m3u",
            &FetchConfig::default(),
            &None,
            &sleep,
        )
        .unwrap_err();

        assert_eq!(transport.request_count(), 4);
        let EngineError::AcquisitionFailed { attempts, message } = err;
        assert_eq!(attempts, 4);
        assert!(message.contains("connection reset"), "got: {}", message);

        // Backoff delays non-decreasing and capped at 8s
        let delays = recorded.borrow();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(8)));
    }

    #[test]
    fn test_zero_channel_body_is_retryable_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Ok((200, None, b"#EXTM3U\n".to_vec())),
            Ok((200, None, PLAYLIST.as_bytes().to_vec())),
        ]);
        let parsed =
            download_playlist(&transport, "http://example.com/p.m3u", &FetchConfig::default(), &None, &no_sleep())
                .unwrap();
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(transport.request_count(), 2);
    }

    #[test]
    fn test_gzip_body_detected_by_magic_bytes() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PLAYLIST.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();

        let transport = ScriptedTransport::new(vec![Ok((200, None, gz))]);
        let parsed =
            download_playlist(&transport, "http://example.com/playlist", &FetchConfig::default(), &None, &no_sleep())
                .unwrap();
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.channels[0].name, "CNN");
    }

    #[test]
    fn test_progress_percentages_non_decreasing() {
        let body = PLAYLIST.repeat(200);
        let transport = ScriptedTransport::new(vec![Ok((
            200,
            Some(body.len() as u64),
            body.into_bytes(),
        ))]);

        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: Option<ProgressCallback> = Some(Box::new(move |_msg, pct| {
            if let Some(p) = pct {
                sink.lock().unwrap().push(p);
            }
        }));

        download_playlist(
            &transport,
            "http://example.com/p.m3u",
            &FetchConfig::default(),
            &progress,
            &no_sleep(),
        )
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100);
    }
}
