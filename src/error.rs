//! Engine error taxonomy
//!
//! Only playlist acquisition can fail a load. Guide-stage failures are
//! downgraded to `Snapshot::guide_warning` and a blank playlist URL
//! short-circuits to an empty snapshot without raising an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Playlist could not be acquired after exhausting retries and the
    /// provider-API fallback. Carries the last concrete diagnostic.
    #[error("playlist acquisition failed after {attempts} attempts: {message}")]
    AcquisitionFailed { attempts: u32, message: String },
}
