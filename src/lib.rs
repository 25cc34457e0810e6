//! IPTV ingestion and channel-resolution engine
//!
//! Turns a playlist URL (and optional XMLTV guide URL) into a structured,
//! queryable set of channels with now/next program metadata, cached on
//! disk across sessions. Provider (Xtream Codes style) portals are
//! detected from the playlist URL and queried through their JSON API
//! before falling back to a plain playlist download.
//!
//! The entry point is [`Engine::load_snapshot`]; everything else exists
//! in its service.

pub mod api;
pub mod cache;
pub mod engine;
pub mod epg;
pub mod error;
pub mod fetch;
pub mod models;
pub mod playlist;
pub mod provider;

pub use engine::{ConfigSource, Engine, EngineSettings, ProfileSource};
pub use error::EngineError;
pub use fetch::{FetchConfig, ProgressCallback, Transport, UreqTransport};
pub use models::{CacheRecord, Channel, ChannelGroup, NowNext, Program, Snapshot};
