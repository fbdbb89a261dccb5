//! The coordinating service: one engine thread owning the store and models.
//!
//! All store mutations happen on this thread, which serializes them by
//! construction; async callers talk to it through a cloneable handle. The
//! embedder and detector live here too, so detection, embedding, matching,
//! and persistence for one request happen without handing shared state
//! around.

use std::collections::HashSet;
use std::io::Cursor;

use image::{imageops, GrayImage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use kindred_core::types::{Embedding, EncounterId, FaceBoxId, PersonId, PhotoId};
use kindred_core::{DetectError, EmbedError, EmbeddingEngine, FaceDetector, LocateError, MatchResult, NormRect};
use kindred_store::reconcile::{self, MoveOutcome, MoveTarget};
use kindred_store::{Encounter, FaceBox, IdentityStore, Person, StoreError, StoreStats};

use crate::labeler;
use crate::redetect;
use crate::scan::PhotoGroup;
use crate::settings::Settings;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("detection: {0}")]
    Detect(#[from] DetectError),
    #[error("embedding: {0}")]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error("image codec: {0}")]
    ImageCodec(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("engine thread exited")]
    ChannelClosed,
}

impl ServiceError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// One face found in a photo under analysis: geometry, crop, identity
/// vector, and ranked suggestions against the current gallery.
#[derive(Debug, Clone)]
pub struct AnalyzedFace {
    pub rect: NormRect,
    pub confidence: f32,
    pub crop_png: Vec<u8>,
    /// Absent when embedding failed; the face stays usable but unmatchable.
    pub embedding: Option<Embedding>,
    pub suggestions: Vec<MatchResult>,
}

/// Who a face label should point at.
#[derive(Debug, Clone)]
pub enum LabelTarget {
    NewPerson { name: String },
    Existing(PersonId),
}

#[derive(Debug, Clone)]
pub struct PropagatedFace {
    pub photo_id: PhotoId,
    pub box_id: FaceBoxId,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct LabelOutcome {
    pub person_id: PersonId,
    /// Faces elsewhere in the encounter that were auto-accepted.
    pub propagated: Vec<PropagatedFace>,
}

#[derive(Debug, Clone)]
pub struct RedetectOutcome {
    pub boxes: Vec<FaceBox>,
    pub transferred: usize,
    /// Old labels no re-detected box could claim.
    pub lost_labels: usize,
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Messages sent from async callers to the engine thread.
enum Request {
    Analyze {
        image: Vec<u8>,
        boost: HashSet<PersonId>,
        reply: Reply<Vec<AnalyzedFace>>,
    },
    LabelFace {
        photo_id: PhotoId,
        box_id: FaceBoxId,
        target: LabelTarget,
        propagate: bool,
        reply: Reply<LabelOutcome>,
    },
    ClearLabel {
        box_id: FaceBoxId,
        reply: Reply<()>,
    },
    Redetect {
        photo_id: PhotoId,
        reply: Reply<RedetectOutcome>,
    },
    LocateFace {
        photo_id: PhotoId,
        tap: (f32, f32),
        zoom: f32,
        reply: Reply<FaceBox>,
    },
    SaveGroup {
        group: Box<PhotoGroup>,
        reply: Reply<Option<EncounterId>>,
    },
    ImportedAssets {
        reply: Reply<HashSet<String>>,
    },
    People {
        reply: Reply<Vec<Person>>,
    },
    Encounters {
        reply: Reply<Vec<Encounter>>,
    },
    Stats {
        reply: Reply<StoreStats>,
    },
    RenamePerson {
        person_id: PersonId,
        name: String,
        reply: Reply<()>,
    },
    MergePeople {
        primary: PersonId,
        secondaries: Vec<PersonId>,
        combine_notes: bool,
        reply: Reply<()>,
    },
    MergeEncounters {
        primary: EncounterId,
        secondaries: Vec<EncounterId>,
        combine_notes: bool,
        reply: Reply<()>,
    },
    MovePhotos {
        photo_ids: Vec<PhotoId>,
        from: EncounterId,
        to: MoveTarget,
        reply: Reply<MoveOutcome>,
    },
    DeletePerson {
        person_id: PersonId,
        reply: Reply<()>,
    },
    DeleteEncounter {
        encounter_id: EncounterId,
        reply: Reply<()>,
    },
}

/// Everything the engine thread owns.
pub(crate) struct ServiceState {
    pub(crate) store: IdentityStore,
    pub(crate) detector: Box<dyn FaceDetector + Send>,
    pub(crate) embedder: Box<dyn EmbeddingEngine + Send>,
    pub(crate) settings: Settings,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Request>,
}

/// Spawn the engine on a dedicated OS thread.
pub fn spawn_service(
    store: IdentityStore,
    detector: Box<dyn FaceDetector + Send>,
    embedder: Box<dyn EmbeddingEngine + Send>,
    settings: Settings,
) -> ServiceHandle {
    let (tx, mut rx) = mpsc::channel::<Request>(16);

    std::thread::Builder::new()
        .name("kindred-engine".into())
        .spawn(move || {
            let mut state = ServiceState {
                store,
                detector,
                embedder,
                settings,
            };
            tracing::info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                dispatch(&mut state, request);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    ServiceHandle { tx }
}

fn dispatch(state: &mut ServiceState, request: Request) {
    match request {
        Request::Analyze {
            image,
            boost,
            reply,
        } => {
            let _ = reply.send(labeler::analyze_photo(state, &image, &boost));
        }
        Request::LabelFace {
            photo_id,
            box_id,
            target,
            propagate,
            reply,
        } => {
            let _ = reply.send(labeler::label_face(state, photo_id, box_id, target, propagate));
        }
        Request::ClearLabel { box_id, reply } => {
            let _ = reply.send(state.store.clear_box_label(box_id).map_err(Into::into));
        }
        Request::Redetect { photo_id, reply } => {
            let _ = reply.send(redetect::redetect_photo(state, photo_id));
        }
        Request::LocateFace {
            photo_id,
            tap,
            zoom,
            reply,
        } => {
            let _ = reply.send(redetect::locate_face(state, photo_id, tap, zoom));
        }
        Request::SaveGroup { group, reply } => {
            let _ = reply.send(labeler::save_group(state, &group));
        }
        Request::ImportedAssets { reply } => {
            let _ = reply.send(state.store.imported_asset_ids().map_err(Into::into));
        }
        Request::People { reply } => {
            let _ = reply.send(state.store.people().map_err(Into::into));
        }
        Request::Encounters { reply } => {
            let _ = reply.send(state.store.encounters().map_err(Into::into));
        }
        Request::Stats { reply } => {
            let _ = reply.send(state.store.stats().map_err(Into::into));
        }
        Request::RenamePerson {
            person_id,
            name,
            reply,
        } => {
            let _ = reply.send(state.store.rename_person(person_id, &name).map_err(Into::into));
        }
        Request::MergePeople {
            primary,
            secondaries,
            combine_notes,
            reply,
        } => {
            let result = reconcile::merge_people(&mut state.store, primary, &secondaries, combine_notes);
            let _ = reply.send(result.map_err(Into::into));
        }
        Request::MergeEncounters {
            primary,
            secondaries,
            combine_notes,
            reply,
        } => {
            let result =
                reconcile::merge_encounters(&mut state.store, primary, &secondaries, combine_notes);
            let _ = reply.send(result.map_err(Into::into));
        }
        Request::MovePhotos {
            photo_ids,
            from,
            to,
            reply,
        } => {
            let result = reconcile::move_photos(&mut state.store, &photo_ids, from, to);
            let _ = reply.send(result.map_err(Into::into));
        }
        Request::DeletePerson { person_id, reply } => {
            let result = reconcile::delete_person(&mut state.store, person_id);
            let _ = reply.send(result.map_err(Into::into));
        }
        Request::DeleteEncounter {
            encounter_id,
            reply,
        } => {
            let result = reconcile::delete_encounter(&mut state.store, encounter_id);
            let _ = reply.send(result.map_err(Into::into));
        }
    }
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ServiceError::ChannelClosed)?
    }

    /// Detect, embed, and rank suggestions for one photo.
    pub async fn analyze(
        &self,
        image: Vec<u8>,
        boost: HashSet<PersonId>,
    ) -> Result<Vec<AnalyzedFace>, ServiceError> {
        self.request(|reply| Request::Analyze {
            image,
            boost,
            reply,
        })
        .await
    }

    /// Assign a person to a face, optionally propagating across the
    /// owning encounter.
    pub async fn label_face(
        &self,
        photo_id: PhotoId,
        box_id: FaceBoxId,
        target: LabelTarget,
        propagate: bool,
    ) -> Result<LabelOutcome, ServiceError> {
        self.request(|reply| Request::LabelFace {
            photo_id,
            box_id,
            target,
            propagate,
            reply,
        })
        .await
    }

    /// Remove a face label and the embedding synthesized for it.
    pub async fn clear_label(&self, box_id: FaceBoxId) -> Result<(), ServiceError> {
        self.request(|reply| Request::ClearLabel { box_id, reply })
            .await
    }

    /// Re-run detection on a photo with the tiling strategy, transferring
    /// labels onto the new boxes.
    pub async fn redetect(&self, photo_id: PhotoId) -> Result<RedetectOutcome, ServiceError> {
        self.request(|reply| Request::Redetect { photo_id, reply })
            .await
    }

    /// Probe for a face around a tapped point and append its box.
    pub async fn locate_face(
        &self,
        photo_id: PhotoId,
        tap: (f32, f32),
        zoom: f32,
    ) -> Result<FaceBox, ServiceError> {
        self.request(|reply| Request::LocateFace {
            photo_id,
            tap,
            zoom,
            reply,
        })
        .await
    }

    /// Persist a reviewed photo group as an encounter. Returns `None` when
    /// every photo turned out to be already imported.
    pub async fn save_group(&self, group: PhotoGroup) -> Result<Option<EncounterId>, ServiceError> {
        self.request(|reply| Request::SaveGroup {
            group: Box::new(group),
            reply,
        })
        .await
    }

    pub async fn imported_asset_ids(&self) -> Result<HashSet<String>, ServiceError> {
        self.request(|reply| Request::ImportedAssets { reply }).await
    }

    pub async fn people(&self) -> Result<Vec<Person>, ServiceError> {
        self.request(|reply| Request::People { reply }).await
    }

    pub async fn encounters(&self) -> Result<Vec<Encounter>, ServiceError> {
        self.request(|reply| Request::Encounters { reply }).await
    }

    pub async fn stats(&self) -> Result<StoreStats, ServiceError> {
        self.request(|reply| Request::Stats { reply }).await
    }

    pub async fn rename_person(
        &self,
        person_id: PersonId,
        name: String,
    ) -> Result<(), ServiceError> {
        self.request(|reply| Request::RenamePerson {
            person_id,
            name,
            reply,
        })
        .await
    }

    pub async fn merge_people(
        &self,
        primary: PersonId,
        secondaries: Vec<PersonId>,
        combine_notes: bool,
    ) -> Result<(), ServiceError> {
        self.request(|reply| Request::MergePeople {
            primary,
            secondaries,
            combine_notes,
            reply,
        })
        .await
    }

    pub async fn merge_encounters(
        &self,
        primary: EncounterId,
        secondaries: Vec<EncounterId>,
        combine_notes: bool,
    ) -> Result<(), ServiceError> {
        self.request(|reply| Request::MergeEncounters {
            primary,
            secondaries,
            combine_notes,
            reply,
        })
        .await
    }

    pub async fn move_photos(
        &self,
        photo_ids: Vec<PhotoId>,
        from: EncounterId,
        to: MoveTarget,
    ) -> Result<MoveOutcome, ServiceError> {
        self.request(|reply| Request::MovePhotos {
            photo_ids,
            from,
            to,
            reply,
        })
        .await
    }

    pub async fn delete_person(&self, person_id: PersonId) -> Result<(), ServiceError> {
        self.request(|reply| Request::DeletePerson { person_id, reply })
            .await
    }

    pub async fn delete_encounter(&self, encounter_id: EncounterId) -> Result<(), ServiceError> {
        self.request(|reply| Request::DeleteEncounter {
            encounter_id,
            reply,
        })
        .await
    }
}

// --- shared image plumbing for the engine thread ---

pub(crate) fn decode_gray(bytes: &[u8]) -> Result<GrayImage, ServiceError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(|e| ServiceError::ImageCodec(format!("decode: {e}")))
}

pub(crate) fn encode_png(image: &GrayImage) -> Result<Vec<u8>, ServiceError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|e| ServiceError::ImageCodec(format!("encode: {e}")))?;
    Ok(cursor.into_inner())
}

/// Cut a face region out of a decoded photo.
pub(crate) fn crop_rect(image: &GrayImage, rect: &NormRect) -> GrayImage {
    let px = rect.to_pixel_rect(image.width(), image.height());
    imageops::crop_imm(image, px.x, px.y, px.width, px.height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::test_support::{marker_png, MarkerDetector, TableEmbedder};
    use chrono::Utc;
    use kindred_core::matcher::Confidence;
    use kindred_store::{Encounter, EncounterPhoto, FaceEmbedding, Person};

    fn face_rect() -> NormRect {
        NormRect::new(0.25, 0.25, 0.5, 0.5)
    }

    fn embedder_10_and_20(second: Vec<f32>) -> TableEmbedder {
        TableEmbedder::new(&[(10, vec![1.0, 0.0]), (20, second)])
    }

    /// Two-photo encounter, one unlabeled face per photo, markers 10 and 20.
    fn seed_two_photo_encounter(store: &mut IdentityStore) -> (PhotoId, FaceBoxId, PhotoId, FaceBoxId) {
        let mut encounter = Encounter::new(Utc::now());
        let mut photo_a = EncounterPhoto::new(marker_png(10));
        photo_a.faces.push(kindred_store::FaceBox::unlabeled(face_rect(), Some(0.9)));
        let mut photo_b = EncounterPhoto::new(marker_png(20));
        photo_b.faces.push(kindred_store::FaceBox::unlabeled(face_rect(), Some(0.9)));

        let ids = (
            photo_a.id,
            photo_a.faces[0].id,
            photo_b.id,
            photo_b.faces[0].id,
        );
        encounter.photos = vec![photo_a, photo_b];
        store.save_encounter(&encounter, &[]).unwrap();
        ids
    }

    #[tokio::test]
    async fn test_label_propagates_above_auto_accept_threshold() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let (photo_a, box_a, photo_b, box_b) = seed_two_photo_encounter(&mut store);

        let sim = 0.92f32;
        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10, 20])),
            Box::new(embedder_10_and_20(vec![sim, (1.0 - sim * sim).sqrt()])),
            Settings::default(),
        );

        let outcome = service
            .label_face(
                photo_a,
                box_a,
                LabelTarget::NewPerson {
                    name: "Alice".into(),
                },
                true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.propagated.len(), 1);
        assert_eq!(outcome.propagated[0].box_id, box_b);
        assert!((outcome.propagated[0].score - sim).abs() < 1e-3);

        let encounters = service.encounters().await.unwrap();
        let photo = encounters[0]
            .photos
            .iter()
            .find(|p| p.id == photo_b)
            .unwrap();
        let face = &photo.faces[0];
        assert_eq!(face.person_id, Some(outcome.person_id));
        assert_eq!(face.person_name.as_deref(), Some("Alice"));
        assert!(face.auto_accepted);
        assert!((face.confidence.unwrap_or(0.0) - sim).abs() < 1e-3);
        assert_eq!(encounters[0].people, vec![outcome.person_id]);

        // Source label plus one auto-accepted face, one sample each.
        assert_eq!(service.stats().await.unwrap().embeddings, 2);
    }

    #[tokio::test]
    async fn test_dissimilar_faces_are_not_propagated() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let (photo_a, box_a, photo_b, _) = seed_two_photo_encounter(&mut store);

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10, 20])),
            Box::new(embedder_10_and_20(vec![0.6, 0.8])),
            Settings::default(),
        );

        let outcome = service
            .label_face(
                photo_a,
                box_a,
                LabelTarget::NewPerson { name: "Bob".into() },
                true,
            )
            .await
            .unwrap();

        assert!(outcome.propagated.is_empty());
        let encounters = service.encounters().await.unwrap();
        let photo = encounters[0]
            .photos
            .iter()
            .find(|p| p.id == photo_b)
            .unwrap();
        assert!(photo.faces[0].person_id.is_none());
    }

    #[tokio::test]
    async fn test_clear_label_removes_embedding_and_membership() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let (photo_a, box_a, _, _) = seed_two_photo_encounter(&mut store);

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10, 20])),
            Box::new(embedder_10_and_20(vec![0.0, 1.0])),
            Settings::default(),
        );

        service
            .label_face(
                photo_a,
                box_a,
                LabelTarget::NewPerson {
                    name: "Cara".into(),
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(service.stats().await.unwrap().embeddings, 1);

        service.clear_label(box_a).await.unwrap();

        assert_eq!(service.stats().await.unwrap().embeddings, 0);
        let encounters = service.encounters().await.unwrap();
        assert!(encounters[0].people.is_empty());
        let photo = encounters[0]
            .photos
            .iter()
            .find(|p| p.id == photo_a)
            .unwrap();
        assert!(photo.faces[0].person_id.is_none());
    }

    #[tokio::test]
    async fn test_analyze_ranks_known_people() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let alice = Person::new("Alice", Utc::now());
        store.insert_person(&alice).unwrap();
        store
            .insert_embedding(&FaceEmbedding::new(
                alice.id,
                Embedding::new(vec![1.0, 0.0]),
                Utc::now(),
            ))
            .unwrap();

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10])),
            Box::new(embedder_10_and_20(vec![0.0, 1.0])),
            Settings::default(),
        );

        let faces = service
            .analyze(marker_png(10), HashSet::new())
            .await
            .unwrap();
        assert_eq!(faces.len(), 1);
        let top = &faces[0].suggestions[0];
        assert_eq!(top.person_id, alice.id);
        assert!((top.score - 1.0).abs() < 1e-5);
        assert_eq!(top.confidence, Confidence::High);
        assert!(faces[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_redetect_transfers_label_and_repoints_embedding() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let alice = Person::new("Alice", Utc::now());
        store.insert_person(&alice).unwrap();

        let mut photo = EncounterPhoto::new(marker_png(10));
        let mut labeled = kindred_store::FaceBox::unlabeled(
            NormRect::new(0.2, 0.2, 0.5, 0.5),
            Some(0.8),
        );
        labeled.person_id = Some(alice.id);
        labeled.person_name = Some("Alice".into());
        let photo_id = photo.id;
        let old_box_id = labeled.id;
        photo.faces.push(labeled);

        let mut encounter = Encounter::new(Utc::now());
        encounter.photos = vec![photo];
        let mut sample =
            FaceEmbedding::new(alice.id, Embedding::new(vec![1.0, 0.0]), Utc::now());
        sample.face_box_id = Some(old_box_id);
        store.save_encounter(&encounter, &[sample]).unwrap();

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10])),
            Box::new(embedder_10_and_20(vec![0.0, 1.0])),
            Settings::default(),
        );

        let outcome = service.redetect(photo_id).await.unwrap();
        assert_eq!(outcome.boxes.len(), 1);
        assert_eq!(outcome.transferred, 1);
        assert_eq!(outcome.lost_labels, 0);
        assert_eq!(outcome.boxes[0].person_id, Some(alice.id));
        assert_ne!(outcome.boxes[0].id, old_box_id);

        // The person's sample followed their label onto the new box.
        assert_eq!(service.stats().await.unwrap().embeddings, 1);
        let encounters = service.encounters().await.unwrap();
        assert_eq!(
            encounters[0].photos[0].faces[0].person_name.as_deref(),
            Some("Alice")
        );
    }

    #[tokio::test]
    async fn test_locate_appends_box_and_guards_duplicates() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let mut encounter = Encounter::new(Utc::now());
        let photo = EncounterPhoto::new(marker_png(10));
        let photo_id = photo.id;
        encounter.photos = vec![photo];
        store.save_encounter(&encounter, &[]).unwrap();

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10])),
            Box::new(embedder_10_and_20(vec![0.0, 1.0])),
            Settings::default(),
        );

        let located = service.locate_face(photo_id, (0.5, 0.5), 1.0).await.unwrap();
        assert!(located.person_id.is_none());

        let encounters = service.encounters().await.unwrap();
        assert_eq!(encounters[0].photos[0].faces.len(), 1);

        // Tapping the same spot again finds the same face: duplicate guard.
        let err = service
            .locate_face(photo_id, (0.5, 0.5), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Locate(LocateError::DuplicateRegion)
        ));
    }

    #[tokio::test]
    async fn test_locate_no_face_is_retryable() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let mut encounter = Encounter::new(Utc::now());
        let photo = EncounterPhoto::new(marker_png(30));
        let photo_id = photo.id;
        encounter.photos = vec![photo];
        store.save_encounter(&encounter, &[]).unwrap();

        let service = spawn_service(
            store,
            Box::new(MarkerDetector::new(vec![10])),
            Box::new(embedder_10_and_20(vec![0.0, 1.0])),
            Settings::default(),
        );

        let err = service
            .locate_face(photo_id, (0.3, 0.7), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Locate(LocateError::NoFaceFound)
        ));
    }
}
