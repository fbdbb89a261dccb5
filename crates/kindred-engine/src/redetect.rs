//! Re-detection and locate-missing-face, applied to stored photos.

use kindred_core::tiling::{transfer_labels, PriorLabel, TilingConfig, TilingDetector};
use kindred_core::types::{EmbeddingId, FaceBoxId, PhotoId};
use kindred_store::FaceBox;

use crate::service::{decode_gray, RedetectOutcome, ServiceError, ServiceState};

fn tiling_config(state: &ServiceState) -> TilingConfig {
    TilingConfig {
        locate_fraction: state.settings.locate_crop_fraction,
        ..TilingConfig::default()
    }
}

/// Re-run detection over a photo with the tiling strategy, carry old labels
/// onto the new boxes where geometry allows, and replace the box set.
///
/// Embeddings follow their labels: a transferred label re-points its
/// embedding at the new box; a lost label takes its embedding with it.
pub(crate) fn redetect_photo(
    state: &mut ServiceState,
    photo_id: PhotoId,
) -> Result<RedetectOutcome, ServiceError> {
    let (_, photo) = state
        .store
        .photo(photo_id)?
        .ok_or_else(|| ServiceError::not_found("photo", photo_id))?;
    let gray = decode_gray(&photo.image)?;

    let config = tiling_config(state);
    let transfer_iou = config.transfer_iou;
    let detected = {
        let mut tiling = TilingDetector::with_config(&mut state.detector, config);
        tiling.redetect(&gray)?
    };

    let labeled_old: Vec<&FaceBox> = photo
        .faces
        .iter()
        .filter(|f| f.person_id.is_some())
        .collect();
    let prior: Vec<PriorLabel> = labeled_old
        .iter()
        .filter_map(|f| {
            Some(PriorLabel {
                rect: f.rect,
                person_id: f.person_id?,
                person_name: f.person_name.clone().unwrap_or_default(),
            })
        })
        .collect();

    let rects: Vec<_> = detected.iter().map(|f| f.rect).collect();
    let assignments = transfer_labels(&prior, &rects, transfer_iou);

    let mut new_boxes = Vec::with_capacity(detected.len());
    let mut repoint: Vec<(EmbeddingId, FaceBoxId)> = Vec::new();
    let mut claimed = vec![false; labeled_old.len()];

    for (i, face) in detected.iter().enumerate() {
        let mut face_box = FaceBox::unlabeled(face.rect, None);
        if let Some(label_idx) = assignments[i] {
            let old = labeled_old[label_idx];
            face_box.person_id = old.person_id;
            face_box.person_name = old.person_name.clone();
            face_box.confidence = old.confidence;
            face_box.auto_accepted = old.auto_accepted;
            if let Some(embedding) = state.store.embedding_for_box(old.id)? {
                repoint.push((embedding.id, face_box.id));
            }
            claimed[label_idx] = true;
        }
        new_boxes.push(face_box);
    }

    let mut drop_embeddings = Vec::new();
    for (idx, old) in labeled_old.iter().enumerate() {
        if !claimed[idx] {
            if let Some(embedding) = state.store.embedding_for_box(old.id)? {
                drop_embeddings.push(embedding.id);
            }
        }
    }

    let lost_labels = claimed.iter().filter(|c| !**c).count();
    state
        .store
        .apply_redetect(photo_id, &new_boxes, &repoint, &drop_embeddings)?;

    tracing::info!(
        photo = %photo_id,
        boxes = new_boxes.len(),
        transferred = labeled_old.len() - lost_labels,
        lost_labels,
        "re-detection applied"
    );
    Ok(RedetectOutcome {
        transferred: labeled_old.len() - lost_labels,
        lost_labels,
        boxes: new_boxes,
    })
}

/// Probe for a face around a tapped point and append its (unlabeled) box,
/// ready for the label picker.
pub(crate) fn locate_face(
    state: &mut ServiceState,
    photo_id: PhotoId,
    tap: (f32, f32),
    zoom: f32,
) -> Result<FaceBox, ServiceError> {
    let (_, photo) = state
        .store
        .photo(photo_id)?
        .ok_or_else(|| ServiceError::not_found("photo", photo_id))?;
    let gray = decode_gray(&photo.image)?;
    let existing: Vec<_> = photo.faces.iter().map(|f| f.rect).collect();

    let config = tiling_config(state);
    let found = {
        let mut tiling = TilingDetector::with_config(&mut state.detector, config);
        tiling.locate(&gray, tap, zoom, &existing)?
    };

    let face_box = FaceBox::unlabeled(found.rect, None);
    state.store.append_box(photo_id, &face_box)?;
    tracing::info!(photo = %photo_id, box_id = %face_box.id, "face located manually");
    Ok(face_box)
}
