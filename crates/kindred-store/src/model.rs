//! Typed entities backing the identity store.
//!
//! Collections are always materialized: "no items" is an empty vec, never an
//! absent one, so callers never nil-coalesce.

use chrono::{DateTime, Utc};
use serde::Serialize;

use kindred_core::types::{
    Embedding, EmbeddingId, EncounterId, FaceBoxId, PersonId, PhotoId, TagId,
};
use kindred_core::NormRect;
use kindred_platform::GpsPoint;

/// An identity: someone the user has met and labeled at least once.
#[derive(Debug, Clone, Serialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub notes: String,
    pub relationship: String,
    pub company: String,
    pub job_title: String,
    /// Free-text "how we met" context.
    pub context: String,
    pub favorite: bool,
    pub is_me: bool,
    /// Opaque link into the host contacts database.
    pub contact_id: Option<String>,
    /// Which stored embedding's crop is the canonical face for display.
    pub profile_embedding_id: Option<EmbeddingId>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Person {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: PersonId::new(),
            name: name.into(),
            notes: String::new(),
            relationship: String::new(),
            company: String::new(),
            job_title: String::new(),
            context: String::new(),
            favorite: false,
            is_me: false,
            contact_id: None,
            profile_embedding_id: None,
            created_at,
            last_seen_at: None,
        }
    }
}

/// A dated gathering where one or more known people were photographed.
#[derive(Debug, Clone, Serialize)]
pub struct Encounter {
    pub id: EncounterId,
    pub occurred_at: DateTime<Utc>,
    pub occasion: String,
    pub location_name: String,
    pub notes: String,
    pub gps: Option<GpsPoint>,
    pub favorite: bool,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub photos: Vec<EncounterPhoto>,
    /// Derived from face boxes; resynced by the store after box mutations.
    pub people: Vec<PersonId>,
    pub tags: Vec<TagId>,
}

impl Encounter {
    pub fn new(occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: EncounterId::new(),
            occurred_at,
            occasion: String::new(),
            location_name: String::new(),
            notes: String::new(),
            gps: None,
            favorite: false,
            thumbnail: None,
            photos: Vec::new(),
            people: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// One physical photo belonging to an encounter.
#[derive(Debug, Clone, Serialize)]
pub struct EncounterPhoto {
    pub id: PhotoId,
    #[serde(skip)]
    pub image: Vec<u8>,
    pub captured_at: Option<DateTime<Utc>>,
    pub gps: Option<GpsPoint>,
    /// Library identifier of the source asset; the scan de-duplication key.
    pub asset_id: Option<String>,
    pub faces: Vec<FaceBox>,
}

impl EncounterPhoto {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            id: PhotoId::new(),
            image,
            captured_at: None,
            gps: None,
            asset_id: None,
            faces: Vec::new(),
        }
    }
}

/// One detected (or manually located) face region within a photo.
#[derive(Debug, Clone, Serialize)]
pub struct FaceBox {
    pub id: FaceBoxId,
    pub rect: NormRect,
    pub person_id: Option<PersonId>,
    /// Denormalized for display without a join; the store fans out renames.
    pub person_name: Option<String>,
    pub confidence: Option<f32>,
    /// True when assigned by propagation or scan auto-accept rather than a
    /// direct user action.
    pub auto_accepted: bool,
}

impl FaceBox {
    pub fn unlabeled(rect: NormRect, confidence: Option<f32>) -> Self {
        Self {
            id: FaceBoxId::new(),
            rect,
            person_id: None,
            person_name: None,
            confidence,
            auto_accepted: false,
        }
    }
}

/// A stored face identity sample, exclusively owned by one person.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub id: EmbeddingId,
    pub person_id: PersonId,
    pub embedding: Embedding,
    /// Compressed face-crop bytes for display.
    pub crop: Option<Vec<u8>>,
    /// Provenance: where this sample came from. Nulled when the source
    /// encounter is deleted.
    pub encounter_id: Option<EncounterId>,
    pub face_box_id: Option<FaceBoxId>,
    pub created_at: DateTime<Utc>,
}

impl FaceEmbedding {
    pub fn new(person_id: PersonId, embedding: Embedding, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EmbeddingId::new(),
            person_id,
            embedding,
            crop: None,
            encounter_id: None,
            face_box_id: None,
            created_at,
        }
    }
}

/// A name + color, attachable to people and encounters.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub color: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: TagId::new(),
            name: name.into(),
            color: color.into(),
        }
    }
}

/// One face-label assignment, applied atomically (possibly in a batch).
#[derive(Debug, Clone)]
pub struct LabelApplication {
    pub photo_id: PhotoId,
    pub box_id: FaceBoxId,
    pub person_id: PersonId,
    pub person_name: String,
    pub confidence: Option<f32>,
    pub auto_accepted: bool,
    /// Embedding synthesized from the face crop; absent when embedding
    /// failed (the label still applies).
    pub embedding: Option<FaceEmbedding>,
    pub labeled_at: DateTime<Utc>,
}

/// Row counts for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub people: usize,
    pub encounters: usize,
    pub photos: usize,
    pub face_boxes: usize,
    pub embeddings: usize,
    pub tags: usize,
}
