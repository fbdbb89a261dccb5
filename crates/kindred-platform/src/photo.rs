//! Read-only photo library access.
//!
//! Assets carry a stable library identifier, a capture timestamp, optional
//! GPS coordinates, and lazily available image bytes. Cloud-backed libraries
//! may return an asset before its original has been downloaded; callers must
//! tolerate `image: None` and skip or retry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in meters, for haversine distance.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("photo library unavailable: {0}")]
    Unavailable(String),
    #[error("photo library access denied")]
    AccessDenied,
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// A GPS coordinate attached to a photo or encounter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance to another point, in meters (haversine).
    pub fn distance_meters(&self, other: &GpsPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// One photo in the host's library.
#[derive(Debug, Clone)]
pub struct PhotoAsset {
    /// Stable library identifier, used for scan de-duplication.
    pub asset_id: String,
    pub captured_at: DateTime<Utc>,
    pub gps: Option<GpsPoint>,
    /// Compressed image bytes. `None` while a cloud original is still
    /// downloading; callers skip the asset and may retry on a later pass.
    pub image: Option<Vec<u8>>,
}

/// Closed date interval for a library fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// Preset scan ranges offered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimePreset {
    LastWeek,
    LastMonth,
    LastThreeMonths,
    LastYear,
}

impl TimePreset {
    /// The concrete window this preset denotes, ending at `end`.
    pub fn window_ending(&self, end: DateTime<Utc>) -> TimeWindow {
        let span = match self {
            TimePreset::LastWeek => Duration::days(7),
            TimePreset::LastMonth => Duration::days(30),
            TimePreset::LastThreeMonths => Duration::days(90),
            TimePreset::LastYear => Duration::days(365),
        };
        TimeWindow::new(end - span, end)
    }
}

/// Host photo library. Read-only; paging is caller-controlled via `limit`.
///
/// Implementations return assets ordered by capture time ascending.
pub trait PhotoLibrary {
    fn fetch(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<PhotoAsset>, LibraryError>> + Send;

    fn count(
        &self,
        window: TimeWindow,
    ) -> impl std::future::Future<Output = Result<usize, LibraryError>> + Send;
}

/// In-memory photo library for tests and offline tooling.
#[derive(Debug, Default)]
pub struct MemoryPhotoLibrary {
    assets: Vec<PhotoAsset>,
}

impl MemoryPhotoLibrary {
    pub fn new(mut assets: Vec<PhotoAsset>) -> Self {
        assets.sort_by_key(|a| a.captured_at);
        Self { assets }
    }

    pub fn push(&mut self, asset: PhotoAsset) {
        self.assets.push(asset);
        self.assets.sort_by_key(|a| a.captured_at);
    }
}

impl PhotoLibrary for MemoryPhotoLibrary {
    async fn fetch(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<PhotoAsset>, LibraryError> {
        Ok(self
            .assets
            .iter()
            .filter(|a| window.contains(a.captured_at))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, window: TimeWindow) -> Result<usize, LibraryError> {
        Ok(self
            .assets
            .iter()
            .filter(|a| window.contains(a.captured_at))
            .count())
    }
}
