//! Face labeling, suggestion ranking, propagation, and group persistence.
//!
//! These run on the engine thread. Within one face's flow the embedding is
//! always produced before matching or propagation; per-face failures are
//! logged and skipped so a bad crop never sinks the batch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use kindred_core::matcher::{find_matches, MatchParams};
use kindred_core::types::{Embedding, EmbeddingId, EncounterId, FaceBoxId, PersonId, PhotoId};
use kindred_core::{DetectError, DetectOptions};
use kindred_store::{Encounter, EncounterPhoto, FaceBox, FaceEmbedding, LabelApplication, Person};

use crate::scan::PhotoGroup;
use crate::service::{
    crop_rect, decode_gray, encode_png, AnalyzedFace, LabelOutcome, LabelTarget, PropagatedFace,
    ServiceError, ServiceState,
};

/// Detect faces in a photo, embed each, and rank gallery suggestions.
pub(crate) fn analyze_photo(
    state: &mut ServiceState,
    image: &[u8],
    boost: &HashSet<PersonId>,
) -> Result<Vec<AnalyzedFace>, ServiceError> {
    let gray = decode_gray(image)?;

    let faces = match state.detector.detect(&gray, DetectOptions::default()) {
        Ok(faces) => faces,
        Err(DetectError::NoUsableRegion) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let gallery = state.store.gallery()?;
    let params = MatchParams {
        threshold: state.settings.suggest_threshold,
        top_k: state.settings.suggest_top_k,
        boost: boost.clone(),
        boost_bonus: state.settings.boost_bonus,
    };

    let mut analyzed = Vec::with_capacity(faces.len());
    for face in faces {
        // Embedding must land before this face can be matched.
        let embedding = match state.embedder.embed(&face.crop) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "face left unmatchable: embedding failed");
                None
            }
        };
        let suggestions = embedding
            .as_ref()
            .map(|e| find_matches(e, &gallery, &params))
            .unwrap_or_default();

        analyzed.push(AnalyzedFace {
            rect: face.rect,
            confidence: face.confidence,
            crop_png: encode_png(&face.crop)?,
            embedding,
            suggestions,
        });
    }
    Ok(analyzed)
}

/// Assign a person to a face box, synthesizing an embedding sample, then
/// optionally propagate the label across the owning encounter.
pub(crate) fn label_face(
    state: &mut ServiceState,
    photo_id: PhotoId,
    box_id: FaceBoxId,
    target: LabelTarget,
    propagate: bool,
) -> Result<LabelOutcome, ServiceError> {
    let (encounter_id, photo) = state
        .store
        .photo(photo_id)?
        .ok_or_else(|| ServiceError::not_found("photo", photo_id))?;
    let face = photo
        .faces
        .iter()
        .find(|f| f.id == box_id)
        .cloned()
        .ok_or_else(|| ServiceError::not_found("face box", box_id))?;

    let now = Utc::now();
    let person = match target {
        LabelTarget::NewPerson { name } => {
            let person = Person::new(name, now);
            state.store.insert_person(&person)?;
            person
        }
        LabelTarget::Existing(id) => state
            .store
            .person(id)?
            .ok_or_else(|| ServiceError::not_found("person", id))?,
    };

    let gray = decode_gray(&photo.image)?;
    let source_crop = crop_rect(&gray, &face.rect);
    let source_embedding = match state.embedder.embed(&source_crop) {
        Ok(e) => Some(e),
        Err(e) => {
            tracing::warn!(error = %e, box_id = %box_id, "labeling without embedding sample");
            None
        }
    };

    let embedding_record = source_embedding.clone().map(|embedding| FaceEmbedding {
        id: EmbeddingId::new(),
        person_id: person.id,
        embedding,
        crop: encode_png(&source_crop).ok(),
        encounter_id: Some(encounter_id),
        face_box_id: Some(box_id),
        created_at: now,
    });

    state.store.apply_labels(&[LabelApplication {
        photo_id,
        box_id,
        person_id: person.id,
        person_name: person.name.clone(),
        confidence: None,
        auto_accepted: false,
        embedding: embedding_record,
        labeled_at: now,
    }])?;
    tracing::info!(person = %person.id, box_id = %box_id, "face labeled");

    let propagated = match (&source_embedding, propagate) {
        (Some(source), true) => {
            propagate_label(state, encounter_id, box_id, &person, source, now)?
        }
        (None, true) => {
            tracing::warn!("skipping propagation: no source embedding");
            Vec::new()
        }
        _ => Vec::new(),
    };

    Ok(LabelOutcome {
        person_id: person.id,
        propagated,
    })
}

/// Extend a fresh label to sufficiently similar unlabeled faces in the
/// same encounter.
///
/// Each target face is judged independently against the fixed source
/// embedding; auto-accepted boxes keep their score and stay one-action
/// removable.
fn propagate_label(
    state: &mut ServiceState,
    encounter_id: EncounterId,
    source_box: FaceBoxId,
    person: &Person,
    source: &Embedding,
    now: DateTime<Utc>,
) -> Result<Vec<PropagatedFace>, ServiceError> {
    let Some(encounter) = state.store.encounter(encounter_id)? else {
        return Ok(Vec::new());
    };

    let mut batch = Vec::new();
    let mut propagated = Vec::new();

    for photo in &encounter.photos {
        let candidates: Vec<&FaceBox> = photo
            .faces
            .iter()
            .filter(|f| f.person_id.is_none() && f.id != source_box)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let gray = match decode_gray(&photo.image) {
            Ok(gray) => gray,
            Err(e) => {
                tracing::warn!(photo = %photo.id, error = %e, "propagation skipped photo");
                continue;
            }
        };

        for face in candidates {
            let crop = crop_rect(&gray, &face.rect);
            let embedding = match state.embedder.embed(&crop) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(box_id = %face.id, error = %e, "propagation skipped face");
                    continue;
                }
            };

            let score = embedding.similarity(source);
            if score < state.settings.auto_accept_threshold {
                continue;
            }

            batch.push(LabelApplication {
                photo_id: photo.id,
                box_id: face.id,
                person_id: person.id,
                person_name: person.name.clone(),
                confidence: Some(score),
                auto_accepted: true,
                embedding: Some(FaceEmbedding {
                    id: EmbeddingId::new(),
                    person_id: person.id,
                    embedding,
                    crop: encode_png(&crop).ok(),
                    encounter_id: Some(encounter_id),
                    face_box_id: Some(face.id),
                    created_at: now,
                }),
                labeled_at: now,
            });
            propagated.push(PropagatedFace {
                photo_id: photo.id,
                box_id: face.id,
                score,
            });
        }
    }

    if !batch.is_empty() {
        state.store.apply_labels(&batch)?;
    }
    tracing::info!(
        person = %person.id,
        encounter = %encounter_id,
        auto_accepted = propagated.len(),
        "label propagation finished"
    );
    Ok(propagated)
}

/// Persist a reviewed photo group as an encounter.
///
/// Photos already imported (by asset id) are stripped first; a group left
/// with nothing is discarded and reported as `None`.
pub(crate) fn save_group(
    state: &mut ServiceState,
    group: &PhotoGroup,
) -> Result<Option<EncounterId>, ServiceError> {
    let imported = state.store.imported_asset_ids()?;
    let now = Utc::now();

    let fresh: Vec<_> = group
        .photos
        .iter()
        .filter(|p| p.asset.image.is_some() && !imported.contains(&p.asset.asset_id))
        .collect();
    let stale = group.photos.len() - fresh.len();
    if stale > 0 {
        tracing::info!(stale, "dropping already-imported photos from group");
    }
    let Some(occurred_at) = fresh.iter().map(|p| p.asset.captured_at).min() else {
        return Ok(None);
    };

    let mut encounter = Encounter::new(occurred_at);
    encounter.location_name = group.location_name.clone().unwrap_or_default();
    encounter.gps = group.gps;

    let mut embeddings = Vec::new();
    for scanned in fresh {
        let Some(image) = scanned.asset.image.clone() else {
            continue;
        };
        let mut photo = EncounterPhoto::new(image);
        photo.captured_at = Some(scanned.asset.captured_at);
        photo.gps = scanned.asset.gps;
        photo.asset_id = Some(scanned.asset.asset_id.clone());

        for face in &scanned.faces {
            let mut face_box = FaceBox::unlabeled(face.rect, None);
            if let Some((person_id, score)) = face.assigned {
                match state.store.person(person_id)? {
                    Some(person) => {
                        face_box.person_id = Some(person.id);
                        face_box.person_name = Some(person.name.clone());
                        face_box.confidence = Some(score);
                        face_box.auto_accepted = face.auto_accepted;
                        if let Some(embedding) = &face.embedding {
                            embeddings.push(FaceEmbedding {
                                id: EmbeddingId::new(),
                                person_id: person.id,
                                embedding: embedding.clone(),
                                crop: Some(face.crop_png.clone()),
                                encounter_id: Some(encounter.id),
                                face_box_id: Some(face_box.id),
                                created_at: now,
                            });
                        }
                    }
                    None => {
                        tracing::warn!(person = %person_id, "assigned person gone; face left unlabeled");
                    }
                }
            }
            photo.faces.push(face_box);
        }
        encounter.photos.push(photo);
    }

    encounter.thumbnail = encounter.photos.first().map(|p| p.image.clone());
    state.store.save_encounter(&encounter, &embeddings)?;
    Ok(Some(encounter.id))
}
