//! Library scanning: fetch a time window, analyze each photo, and cluster
//! the results into candidate encounters for review.
//!
//! A scan session is resumable: it remembers which assets it has already
//! analyzed, and assets already imported into saved encounters are filtered
//! out, so "Continue" never reprocesses or reimports. A newer scan
//! supersedes an older one; stale results are discarded at commit.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use kindred_core::types::{Embedding, EncounterId, PersonId};
use kindred_core::{MatchResult, NormRect};
use kindred_platform::{Geocoder, GpsPoint, LibraryError, PhotoAsset, PhotoLibrary, TimeWindow};

use crate::service::{ServiceError, ServiceHandle};
use crate::settings::Settings;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("photo library: {0}")]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
}

/// Incremental progress for a cancellable scan UI.
#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub scanned: usize,
    pub total: usize,
}

/// One face found during scanning, with the auto-accept decision applied.
#[derive(Debug, Clone)]
pub struct ScannedFace {
    pub rect: NormRect,
    pub confidence: f32,
    pub crop_png: Vec<u8>,
    pub embedding: Option<Embedding>,
    pub suggestions: Vec<MatchResult>,
    /// Person this face was assigned to, with the similarity that earned it.
    pub assigned: Option<(PersonId, f32)>,
    pub auto_accepted: bool,
}

#[derive(Debug, Clone)]
pub struct ScannedPhoto {
    pub asset: PhotoAsset,
    pub faces: Vec<ScannedFace>,
}

/// A candidate encounter: photos close in time (and space, when GPS is
/// available), not yet persisted.
#[derive(Debug, Clone)]
pub struct PhotoGroup {
    pub photos: Vec<ScannedPhoto>,
    pub started_at: DateTime<Utc>,
    pub location_name: Option<String>,
    pub gps: Option<GpsPoint>,
}

impl PhotoGroup {
    fn seeded(photo: ScannedPhoto) -> Self {
        Self {
            started_at: photo.asset.captured_at,
            gps: photo.asset.gps,
            location_name: None,
            photos: vec![photo],
        }
    }

    pub fn face_count(&self) -> usize {
        self.photos.iter().map(|p| p.faces.len()).sum()
    }
}

/// Identifies one scan run; only the latest token's results commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanToken(u64);

/// The raw output of one scan run, not yet folded into the session.
#[derive(Debug)]
pub struct ScanHarvest {
    token: ScanToken,
    pub photos: Vec<ScannedPhoto>,
    /// Cloud originals not yet downloaded; retried on a later pass.
    pub undownloaded: usize,
    /// Assets skipped because they were already scanned or imported.
    pub skipped_known: usize,
}

/// A user-facing scan session over the host photo library.
pub struct ScanSession<L, G> {
    library: L,
    geocoder: G,
    service: ServiceHandle,
    settings: Settings,
    scanned_assets: HashSet<String>,
    confirmed_people: HashSet<PersonId>,
    groups: Vec<PhotoGroup>,
    generation: u64,
}

impl<L: PhotoLibrary, G: Geocoder> ScanSession<L, G> {
    pub fn new(library: L, geocoder: G, service: ServiceHandle, settings: Settings) -> Self {
        Self {
            library,
            geocoder,
            service,
            settings,
            scanned_assets: HashSet::new(),
            confirmed_people: HashSet::new(),
            groups: Vec::new(),
            generation: 0,
        }
    }

    pub fn groups(&self) -> &[PhotoGroup] {
        &self.groups
    }

    /// Record that a person is confirmed present in this session, biasing
    /// subsequent match suggestions toward them.
    pub fn confirm_person(&mut self, person_id: PersonId) {
        self.confirmed_people.insert(person_id);
    }

    /// Start (or restart) a scan run, superseding any still-running one.
    pub fn begin(&mut self) -> ScanToken {
        self.generation += 1;
        ScanToken(self.generation)
    }

    /// Fetch and analyze a window of the library.
    ///
    /// Already-scanned and already-imported assets are filtered out;
    /// progress is reported per processed photo and never blocks.
    pub async fn collect(
        &self,
        token: ScanToken,
        window: TimeWindow,
        limit: usize,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<ScanHarvest, ScanError> {
        let total = self.library.count(window).await?;
        let assets = self.library.fetch(window, limit).await?;
        let imported = self.service.imported_asset_ids().await?;

        let mut boost = self.confirmed_people.clone();
        let mut photos = Vec::new();
        let mut undownloaded = 0usize;
        let mut skipped_known = 0usize;

        for (index, asset) in assets.into_iter().enumerate() {
            if self.scanned_assets.contains(&asset.asset_id)
                || imported.contains(&asset.asset_id)
            {
                skipped_known += 1;
                continue;
            }
            let Some(bytes) = asset.image.clone() else {
                tracing::debug!(asset = %asset.asset_id, "original not downloaded yet, skipping");
                undownloaded += 1;
                continue;
            };

            let analyzed = self.service.analyze(bytes, boost.clone()).await?;
            let mut faces = Vec::with_capacity(analyzed.len());
            for face in analyzed {
                let assigned = face
                    .suggestions
                    .first()
                    .filter(|m| m.score >= self.settings.auto_accept_threshold)
                    .map(|m| (m.person_id, m.score));
                if let Some((person_id, _)) = assigned {
                    boost.insert(person_id);
                }
                faces.push(ScannedFace {
                    rect: face.rect,
                    confidence: face.confidence,
                    crop_png: face.crop_png,
                    embedding: face.embedding,
                    suggestions: face.suggestions,
                    auto_accepted: assigned.is_some(),
                    assigned,
                });
            }
            photos.push(ScannedPhoto { asset, faces });

            if let Some(progress) = &progress {
                let _ = progress.try_send(ScanProgress {
                    scanned: index + 1,
                    total,
                });
            }
        }

        tracing::info!(
            photos = photos.len(),
            undownloaded,
            skipped_known,
            "scan run collected"
        );
        Ok(ScanHarvest {
            token,
            photos,
            undownloaded,
            skipped_known,
        })
    }

    /// Fold a finished scan run into the session.
    ///
    /// Results from a superseded run are discarded (returns 0): late
    /// completions must never corrupt newer state. Returns the number of
    /// groups added.
    pub fn commit(&mut self, harvest: ScanHarvest) -> usize {
        if harvest.token != ScanToken(self.generation) {
            tracing::info!("discarding results from superseded scan run");
            return 0;
        }

        for photo in &harvest.photos {
            self.scanned_assets.insert(photo.asset.asset_id.clone());
            for face in &photo.faces {
                if let Some((person_id, _)) = face.assigned {
                    self.confirmed_people.insert(person_id);
                }
            }
        }

        let groups = cluster_photos(
            harvest.photos,
            self.settings.group_gap(),
            self.settings.group_radius_meters,
        );
        let added = groups.len();
        self.groups.extend(groups);
        added
    }

    /// Resolve place names for groups that have coordinates but no name.
    /// Failures are silent; a group simply keeps no location name.
    pub async fn annotate_locations(&mut self) {
        for group in &mut self.groups {
            if group.location_name.is_some() {
                continue;
            }
            let Some(gps) = group.gps else {
                continue;
            };
            match self.geocoder.reverse(gps).await {
                Ok(name) => group.location_name = Some(name),
                Err(e) => {
                    tracing::debug!(error = %e, "reverse geocoding unavailable");
                }
            }
        }
    }

    /// Manually merge selected groups into one, photos sorted by capture
    /// time, keeping the earliest group's location name when present.
    pub fn merge_groups(&mut self, indices: &[usize]) -> Result<(), ScanError> {
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() < 2 {
            return Err(ScanError::InvalidSelection(
                "select at least two groups to merge".into(),
            ));
        }
        if sorted.last().copied().unwrap_or(0) >= self.groups.len() {
            return Err(ScanError::InvalidSelection("group index out of range".into()));
        }

        let mut selected: Vec<PhotoGroup> =
            sorted.iter().rev().map(|&i| self.groups.remove(i)).collect();
        selected.sort_by_key(|g| g.started_at);

        let started_at = selected[0].started_at;
        let location_name = selected.iter().find_map(|g| g.location_name.clone());
        let gps = selected.iter().find_map(|g| g.gps);
        let mut photos: Vec<ScannedPhoto> =
            selected.into_iter().flat_map(|g| g.photos).collect();
        photos.sort_by_key(|p| p.asset.captured_at);

        self.groups.insert(
            sorted[0],
            PhotoGroup {
                photos,
                started_at,
                location_name,
                gps,
            },
        );
        Ok(())
    }

    /// Strip photos that are already persisted (by asset id) and discard
    /// groups that became empty. Returns the number of discarded groups so
    /// the UI can notify.
    pub async fn refresh_imported(&mut self) -> Result<usize, ScanError> {
        let imported = self.service.imported_asset_ids().await?;
        let before = self.groups.len();
        for group in &mut self.groups {
            group
                .photos
                .retain(|p| !imported.contains(&p.asset.asset_id));
        }
        self.groups.retain(|g| !g.photos.is_empty());
        let discarded = before - self.groups.len();
        if discarded > 0 {
            tracing::info!(discarded, "groups were already fully imported");
        }
        Ok(discarded)
    }

    /// Persist a reviewed group as an encounter and drop it from the
    /// session. Returns `None` when the group turned out fully stale.
    pub async fn save_group(&mut self, index: usize) -> Result<Option<EncounterId>, ScanError> {
        if index >= self.groups.len() {
            return Err(ScanError::InvalidSelection("group index out of range".into()));
        }
        let group = self.groups[index].clone();
        let saved = self.service.save_group(group).await?;
        self.groups.remove(index);
        self.refresh_imported().await?;
        Ok(saved)
    }
}

/// Cluster time-ordered photos into candidate encounters.
///
/// A photo joins the current group while the gap to the previous photo
/// stays within `max_gap` and, when both carry GPS, the jump stays within
/// `max_radius_m`. Total and deterministic for a given input order.
fn cluster_photos(
    mut photos: Vec<ScannedPhoto>,
    max_gap: chrono::Duration,
    max_radius_m: f64,
) -> Vec<PhotoGroup> {
    photos.sort_by_key(|p| p.asset.captured_at);

    let mut groups: Vec<PhotoGroup> = Vec::new();
    for photo in photos {
        let joins = groups
            .last()
            .and_then(|g| g.photos.last())
            .map(|last| {
                let within_gap = photo.asset.captured_at - last.asset.captured_at <= max_gap;
                let within_radius = match (last.asset.gps, photo.asset.gps) {
                    (Some(a), Some(b)) => a.distance_meters(&b) <= max_radius_m,
                    _ => true,
                };
                within_gap && within_radius
            })
            .unwrap_or(false);

        if joins {
            if let Some(group) = groups.last_mut() {
                if group.gps.is_none() {
                    group.gps = photo.asset.gps;
                }
                group.photos.push(photo);
            }
        } else {
            groups.push(PhotoGroup::seeded(photo));
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::spawn_service;
    use crate::test_support::{marker_asset, FixedGeocoder, MarkerDetector, TableEmbedder};
    use chrono::{Duration, TimeZone};
    use kindred_core::types::Embedding as CoreEmbedding;
    use kindred_platform::{MemoryPhotoLibrary, NullGeocoder};
    use kindred_store::{FaceEmbedding, IdentityStore, Person};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()
    }

    fn berlin() -> GpsPoint {
        GpsPoint::new(52.52, 13.405)
    }

    fn munich() -> GpsPoint {
        GpsPoint::new(48.137, 11.575)
    }

    fn window() -> TimeWindow {
        TimeWindow::new(t0() - Duration::days(1), t0() + Duration::days(1))
    }

    fn service_with_empty_store(markers: Vec<u8>) -> crate::service::ServiceHandle {
        let store = IdentityStore::open_in_memory().unwrap();
        spawn_service(
            store,
            Box::new(MarkerDetector::new(markers)),
            Box::new(TableEmbedder::new(&[
                (10, vec![1.0, 0.0]),
                (20, vec![0.0, 1.0]),
            ])),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn test_nearby_photos_form_one_group() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), Some(berlin())),
            marker_asset("b", 20, t0() + Duration::minutes(5), Some(berlin())),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(session.commit(harvest), 1);

        let groups = session.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].photos.len(), 2);
        assert_eq!(groups[0].face_count(), 2);
        assert_eq!(groups[0].started_at, t0());
    }

    #[tokio::test]
    async fn test_time_gap_splits_groups() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), None),
            marker_asset("b", 20, t0() + Duration::hours(5), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(session.commit(harvest), 2);
    }

    #[tokio::test]
    async fn test_distance_splits_groups() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), Some(berlin())),
            marker_asset("b", 20, t0() + Duration::minutes(5), Some(munich())),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(session.commit(harvest), 2);
    }

    #[tokio::test]
    async fn test_continue_never_rescans() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), None),
            marker_asset("b", 20, t0() + Duration::minutes(1), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        session.commit(harvest);

        let token = session.begin();
        let again = session.collect(token, window(), 50, None).await.unwrap();
        assert!(again.photos.is_empty());
        assert_eq!(again.skipped_known, 2);
    }

    #[tokio::test]
    async fn test_undownloaded_assets_are_skipped_not_fatal() {
        let mut pending = marker_asset("cloud", 10, t0(), None);
        pending.image = None;
        let library = MemoryPhotoLibrary::new(vec![
            pending,
            marker_asset("local", 20, t0() + Duration::minutes(1), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(harvest.undownloaded, 1);
        assert_eq!(harvest.photos.len(), 1);
        // The pending asset was not marked scanned, so a later pass retries it.
        session.commit(harvest);
        let token = session.begin();
        let retry = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(retry.undownloaded, 1);
    }

    #[tokio::test]
    async fn test_superseded_results_are_discarded() {
        let library = MemoryPhotoLibrary::new(vec![marker_asset("a", 10, t0(), None)]);
        let service = service_with_empty_store(vec![10]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let stale_token = session.begin();
        let stale = session.collect(stale_token, window(), 50, None).await.unwrap();

        // The user tapped Continue again before the first run finished.
        let _fresh_token = session.begin();

        assert_eq!(session.commit(stale), 0);
        assert!(session.groups().is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_reported() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), None),
            marker_asset("b", 20, t0() + Duration::minutes(1), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let (tx, mut rx) = mpsc::channel(16);
        let token = session.begin();
        session
            .collect(token, window(), 50, Some(tx))
            .await
            .unwrap();

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].scanned, 2);
        assert_eq!(updates[1].total, 2);
    }

    #[tokio::test]
    async fn test_auto_accept_labels_known_person_and_saves() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let alice = Person::new("Alice", t0());
        store.insert_person(&alice).unwrap();
        store
            .insert_embedding(&FaceEmbedding::new(
                alice.id,
                CoreEmbedding::new(vec![1.0, 0.0]),
                t0(),
            ))
            .unwrap();

        let sim = 0.95f32;
        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10])),
            Box::new(TableEmbedder::new(&[(
                10,
                vec![sim, (1.0 - sim * sim).sqrt()],
            )])),
            Settings::default(),
        );

        let library =
            MemoryPhotoLibrary::new(vec![marker_asset("a", 10, t0(), Some(berlin()))]);
        let mut session =
            ScanSession::new(library, NullGeocoder, service.clone(), Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        session.commit(harvest);

        let face = &session.groups()[0].photos[0].faces[0];
        let (person_id, score) = face.assigned.expect("face should be auto-assigned");
        assert_eq!(person_id, alice.id);
        assert!((score - sim).abs() < 1e-3);
        assert!(face.auto_accepted);

        let saved = session.save_group(0).await.unwrap();
        assert!(saved.is_some());
        assert!(session.groups().is_empty());

        let encounters = service.encounters().await.unwrap();
        assert_eq!(encounters.len(), 1);
        let saved_face = &encounters[0].photos[0].faces[0];
        assert_eq!(saved_face.person_id, Some(alice.id));
        assert!(saved_face.auto_accepted);
        assert_eq!(encounters[0].people, vec![alice.id]);
        // The auto-accepted face contributed a second embedding sample.
        assert_eq!(service.stats().await.unwrap().embeddings, 2);

        // Re-scanning the same window imports nothing new.
        let token = session.begin();
        let again = session.collect(token, window(), 50, None).await.unwrap();
        assert!(again.photos.is_empty());
    }

    #[tokio::test]
    async fn test_merge_groups_unions_sorted() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), None),
            marker_asset("b", 20, t0() + Duration::hours(6), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        assert_eq!(session.commit(harvest), 2);

        session.merge_groups(&[1, 0]).unwrap();
        let groups = session.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].photos.len(), 2);
        assert_eq!(groups[0].started_at, t0());
        assert!(groups[0].photos[0].asset.captured_at <= groups[0].photos[1].asset.captured_at);
    }

    #[tokio::test]
    async fn test_merge_needs_two_groups() {
        let library = MemoryPhotoLibrary::new(vec![marker_asset("a", 10, t0(), None)]);
        let service = service_with_empty_store(vec![10]);
        let mut session = ScanSession::new(library, NullGeocoder, service, Settings::default());
        assert!(session.merge_groups(&[0]).is_err());
    }

    #[tokio::test]
    async fn test_geocoding_annotates_groups_with_gps() {
        let library = MemoryPhotoLibrary::new(vec![
            marker_asset("a", 10, t0(), Some(berlin())),
            marker_asset("b", 20, t0() + Duration::hours(6), None),
        ]);
        let service = service_with_empty_store(vec![10, 20]);
        let mut session = ScanSession::new(
            library,
            FixedGeocoder("Berlin".into()),
            service,
            Settings::default(),
        );

        let token = session.begin();
        let harvest = session.collect(token, window(), 50, None).await.unwrap();
        session.commit(harvest);
        session.annotate_locations().await;

        let groups = session.groups();
        assert_eq!(groups[0].location_name.as_deref(), Some("Berlin"));
        // No coordinates, no name; never an error.
        assert!(groups[1].location_name.is_none());
    }

    #[test]
    fn test_cluster_is_deterministic_and_total() {
        let photos: Vec<ScannedPhoto> = (0..5i64)
            .map(|i| ScannedPhoto {
                asset: marker_asset(&format!("p{i}"), 10, t0() + Duration::hours(i * 4), None),
                faces: Vec::new(),
            })
            .collect();

        let a = cluster_photos(photos.clone(), Duration::minutes(180), 500.0);
        let b = cluster_photos(photos.clone(), Duration::minutes(180), 500.0);
        assert_eq!(a.len(), b.len());
        // Every photo lands in exactly one group.
        assert_eq!(a.iter().map(|g| g.photos.len()).sum::<usize>(), 5);
    }
}
