//! Reverse geocoding capability.
//!
//! Place names are decoration on photo groups and encounters. Callers treat
//! every failure as "no name available" and continue; geocoding must never
//! block or fail a scan.

use thiserror::Error;

use crate::photo::GpsPoint;

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("geocoder unavailable: {0}")]
    Unavailable(String),
    #[error("no place name for coordinate")]
    NotFound,
}

/// Resolve a coordinate to a human-readable place name.
pub trait Geocoder {
    fn reverse(
        &self,
        point: GpsPoint,
    ) -> impl std::future::Future<Output = Result<String, GeocodeError>> + Send;
}

/// Geocoder that never resolves anything. Used where place names are not
/// wanted (tests, headless tooling).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGeocoder;

impl Geocoder for NullGeocoder {
    async fn reverse(&self, _point: GpsPoint) -> Result<String, GeocodeError> {
        Err(GeocodeError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_geocoder_never_resolves() {
        let err = NullGeocoder
            .reverse(GpsPoint::new(0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, GeocodeError::NotFound));
    }
}
