//! SQLite-backed identity store.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use kindred_core::matcher::GalleryPerson;
use kindred_core::types::{
    Embedding, EmbeddingId, EncounterId, FaceBoxId, PersonId, PhotoId, TagId,
};
use kindred_core::NormRect;
use kindred_platform::GpsPoint;

use crate::model::{
    Encounter, EncounterPhoto, FaceBox, FaceEmbedding, LabelApplication, Person, StoreStats, Tag,
};
use crate::schema::SCHEMA;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// The identity graph: one open SQLite database.
///
/// Not internally synchronized. The engine serializes all access on its
/// service thread; tools own their store exclusively.
pub struct IdentityStore {
    pub(crate) conn: Connection,
}

impl IdentityStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Invalid(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        Self::from_conn(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // --- people ---

    pub fn insert_person(&mut self, person: &Person) -> Result<(), StoreError> {
        insert_person(&self.conn, person)?;
        Ok(())
    }

    pub fn person(&self, id: PersonId) -> Result<Option<Person>, StoreError> {
        load_person(&self.conn, id)
    }

    pub fn people(&self) -> Result<Vec<Person>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, notes, relationship, company, job_title, context,
                    favorite, is_me, contact_id, profile_embedding_id, created_at, last_seen_at
             FROM people ORDER BY name COLLATE NOCASE, created_at",
        )?;
        let rows = stmt.query_map([], person_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Update a person's scalar fields. Use [`rename_person`](Self::rename_person)
    /// for name changes so the denormalized box names follow.
    pub fn update_person(&mut self, person: &Person) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        update_person_scalars(&tx, person)?;
        // Keep cached box names in line even when callers route a rename
        // through here.
        tx.execute(
            "UPDATE face_boxes SET person_name = ?1 WHERE person_id = ?2",
            params![person.name, person.id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rename a person and fan the new name out to every box that caches it.
    pub fn rename_person(&mut self, id: PersonId, name: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE people SET name = ?1 WHERE id = ?2",
            params![name, id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("person", id));
        }
        tx.execute(
            "UPDATE face_boxes SET person_name = ?1 WHERE person_id = ?2",
            params![name, id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- encounters ---

    /// Persist a new encounter with its photos, boxes, tag links, and any
    /// embeddings synthesized during review, atomically.
    pub fn save_encounter(
        &mut self,
        encounter: &Encounter,
        embeddings: &[FaceEmbedding],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        insert_encounter_row(&tx, encounter)?;
        for (position, photo) in encounter.photos.iter().enumerate() {
            insert_photo(&tx, encounter.id, position as i64, photo)?;
        }
        for tag_id in &encounter.tags {
            tx.execute(
                "INSERT OR IGNORE INTO encounter_tags (encounter_id, tag_id) VALUES (?1, ?2)",
                params![encounter.id.to_string(), tag_id.to_string()],
            )?;
        }
        for embedding in embeddings {
            insert_embedding_row(&tx, embedding)?;
        }
        sync_encounter_people(&tx, encounter.id)?;
        bump_last_seen_for_encounter(&tx, encounter.id, encounter.occurred_at)?;
        tx.commit()?;
        tracing::info!(
            encounter = %encounter.id,
            photos = encounter.photos.len(),
            embeddings = embeddings.len(),
            "encounter saved"
        );
        Ok(())
    }

    pub fn encounter(&self, id: EncounterId) -> Result<Option<Encounter>, StoreError> {
        load_encounter(&self.conn, id)
    }

    pub fn encounters(&self) -> Result<Vec<Encounter>, StoreError> {
        let ids: Vec<EncounterId> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM encounters ORDER BY occurred_at DESC, id")?;
            let rows = stmt.query_map([], |row| parse_id(row, 0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut encounters = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(e) = load_encounter(&self.conn, id)? {
                encounters.push(e);
            }
        }
        Ok(encounters)
    }

    /// Update an encounter's scalar metadata (occasion, location, notes,
    /// date, coordinates, favorite, thumbnail). Photos and membership are
    /// managed through their own operations.
    pub fn update_encounter_meta(&mut self, encounter: &Encounter) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE encounters
             SET occurred_at = ?1, occasion = ?2, location_name = ?3, notes = ?4,
                 latitude = ?5, longitude = ?6, favorite = ?7, thumbnail = ?8
             WHERE id = ?9",
            params![
                ts_to_sql(&encounter.occurred_at),
                encounter.occasion,
                encounter.location_name,
                encounter.notes,
                encounter.gps.map(|g| g.latitude),
                encounter.gps.map(|g| g.longitude),
                encounter.favorite,
                encounter.thumbnail,
                encounter.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("encounter", encounter.id));
        }
        Ok(())
    }

    pub fn photo(&self, id: PhotoId) -> Result<Option<(EncounterId, EncounterPhoto)>, StoreError> {
        load_photo(&self.conn, id)
    }

    pub fn add_photo(
        &mut self,
        encounter_id: EncounterId,
        photo: &EncounterPhoto,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let position = next_photo_position(&tx, encounter_id)?;
        insert_photo(&tx, encounter_id, position, photo)?;
        sync_encounter_people(&tx, encounter_id)?;
        tx.commit()?;
        Ok(())
    }

    // --- face boxes and labels ---

    /// Apply one or more label assignments atomically.
    ///
    /// Updates each box, inserts synthesized embeddings, resyncs the
    /// affected encounters' membership, and advances last-seen timestamps.
    pub fn apply_labels(&mut self, applications: &[LabelApplication]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let mut touched: HashSet<EncounterId> = HashSet::new();

        for app in applications {
            let changed = tx.execute(
                "UPDATE face_boxes
                 SET person_id = ?1, person_name = ?2, confidence = ?3, auto_accepted = ?4
                 WHERE id = ?5",
                params![
                    app.person_id.to_string(),
                    app.person_name,
                    app.confidence.map(|c| c as f64),
                    app.auto_accepted,
                    app.box_id.to_string(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("face box", app.box_id));
            }

            if let Some(embedding) = &app.embedding {
                insert_embedding_row(&tx, embedding)?;
            }

            if let Some(encounter_id) = photo_encounter(&tx, app.photo_id)? {
                touched.insert(encounter_id);
            }

            tx.execute(
                "UPDATE people SET last_seen_at = ?1
                 WHERE id = ?2 AND (last_seen_at IS NULL OR last_seen_at < ?1)",
                params![ts_to_sql(&app.labeled_at), app.person_id.to_string()],
            )?;
        }

        for encounter_id in touched {
            sync_encounter_people(&tx, encounter_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a box's label, deleting the embedding synthesized for it.
    pub fn clear_box_label(&mut self, box_id: FaceBoxId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        let photo_id: Option<PhotoId> = tx
            .query_row(
                "SELECT photo_id FROM face_boxes WHERE id = ?1",
                [box_id.to_string()],
                |row| parse_id(row, 0),
            )
            .optional()?;
        let photo_id = photo_id.ok_or_else(|| StoreError::not_found("face box", box_id))?;

        delete_embeddings_for_box(&tx, box_id)?;
        tx.execute(
            "UPDATE face_boxes
             SET person_id = NULL, person_name = NULL, confidence = NULL, auto_accepted = 0
             WHERE id = ?1",
            [box_id.to_string()],
        )?;

        if let Some(encounter_id) = photo_encounter(&tx, photo_id)? {
            sync_encounter_people(&tx, encounter_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Append a box to a photo (locate-missing-face flow).
    pub fn append_box(&mut self, photo_id: PhotoId, face: &FaceBox) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM face_boxes WHERE photo_id = ?1",
            [photo_id.to_string()],
            |row| row.get(0),
        )?;
        insert_box(&tx, photo_id, position, face)?;
        if let Some(encounter_id) = photo_encounter(&tx, photo_id)? {
            sync_encounter_people(&tx, encounter_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace a photo's boxes after re-detection.
    ///
    /// `repoint` re-attaches surviving embeddings to their new boxes;
    /// `drop_embeddings` removes embeddings whose labels were lost.
    pub fn apply_redetect(
        &mut self,
        photo_id: PhotoId,
        boxes: &[FaceBox],
        repoint: &[(EmbeddingId, FaceBoxId)],
        drop_embeddings: &[EmbeddingId],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        for embedding_id in drop_embeddings {
            delete_embedding_row(&tx, *embedding_id)?;
        }
        tx.execute(
            "DELETE FROM face_boxes WHERE photo_id = ?1",
            [photo_id.to_string()],
        )?;
        for (position, face) in boxes.iter().enumerate() {
            insert_box(&tx, photo_id, position as i64, face)?;
        }
        for (embedding_id, box_id) in repoint {
            tx.execute(
                "UPDATE embeddings SET face_box_id = ?1 WHERE id = ?2",
                params![box_id.to_string(), embedding_id.to_string()],
            )?;
        }

        if let Some(encounter_id) = photo_encounter(&tx, photo_id)? {
            sync_encounter_people(&tx, encounter_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- embeddings ---

    pub fn insert_embedding(&mut self, embedding: &FaceEmbedding) -> Result<(), StoreError> {
        insert_embedding_row(&self.conn, embedding)?;
        Ok(())
    }

    pub fn embeddings_for_person(&self, id: PersonId) -> Result<Vec<FaceEmbedding>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, person_id, vector, model_version, crop, encounter_id, face_box_id, created_at
             FROM embeddings WHERE person_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([id.to_string()], embedding_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn embedding_for_box(
        &self,
        box_id: FaceBoxId,
    ) -> Result<Option<FaceEmbedding>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, person_id, vector, model_version, crop, encounter_id, face_box_id, created_at
             FROM embeddings WHERE face_box_id = ?1",
        )?;
        Ok(stmt
            .query_row([box_id.to_string()], embedding_from_row)
            .optional()?)
    }

    /// Delete an embedding, clearing any profile back-reference first.
    pub fn delete_embedding(&mut self, id: EmbeddingId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        delete_embedding_row(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_profile_embedding(
        &mut self,
        person_id: PersonId,
        embedding_id: Option<EmbeddingId>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE people SET profile_embedding_id = ?1 WHERE id = ?2",
            params![embedding_id.map(|e| e.to_string()), person_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("person", person_id));
        }
        Ok(())
    }

    /// Every person with at least one embedding, with their vectors, in a
    /// stable order for matching.
    pub fn gallery(&self) -> Result<Vec<GalleryPerson>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.person_id, e.vector, e.model_version
             FROM embeddings e JOIN people p ON p.id = e.person_id
             ORDER BY p.created_at, p.id, e.created_at, e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let person_id: PersonId = parse_id(row, 0)?;
            let vector: Vec<u8> = row.get(1)?;
            let model_version: Option<String> = row.get(2)?;
            let embedding = Embedding::from_le_bytes(&vector, model_version)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Blob, Box::new(e)))?;
            Ok((person_id, embedding))
        })?;

        let mut gallery: Vec<GalleryPerson> = Vec::new();
        for row in rows {
            let (person_id, embedding) = row?;
            match gallery.last_mut() {
                Some(person) if person.person_id == person_id => {
                    person.embeddings.push(embedding);
                }
                _ => gallery.push(GalleryPerson {
                    person_id,
                    embeddings: vec![embedding],
                }),
            }
        }
        Ok(gallery)
    }

    // --- scan support ---

    /// Asset identifiers of every photo already imported into an encounter.
    pub fn imported_asset_ids(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT asset_id FROM encounter_photos WHERE asset_id IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    // --- tags ---

    pub fn insert_tag(&mut self, tag: &Tag) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO tags (id, name, color) VALUES (?1, ?2, ?3)",
            params![tag.id.to_string(), tag.name, tag.color],
        )?;
        Ok(())
    }

    pub fn tags(&self) -> Result<Vec<Tag>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, color FROM tags ORDER BY name COLLATE NOCASE")?;
        let rows = stmt.query_map([], |row| {
            Ok(Tag {
                id: parse_id(row, 0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tag_person(&mut self, person_id: PersonId, tag_id: TagId) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO person_tags (person_id, tag_id) VALUES (?1, ?2)",
            params![person_id.to_string(), tag_id.to_string()],
        )?;
        Ok(())
    }

    pub fn untag_person(&mut self, person_id: PersonId, tag_id: TagId) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM person_tags WHERE person_id = ?1 AND tag_id = ?2",
            params![person_id.to_string(), tag_id.to_string()],
        )?;
        Ok(())
    }

    pub fn tag_encounter(
        &mut self,
        encounter_id: EncounterId,
        tag_id: TagId,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO encounter_tags (encounter_id, tag_id) VALUES (?1, ?2)",
            params![encounter_id.to_string(), tag_id.to_string()],
        )?;
        Ok(())
    }

    pub fn untag_encounter(
        &mut self,
        encounter_id: EncounterId,
        tag_id: TagId,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM encounter_tags WHERE encounter_id = ?1 AND tag_id = ?2",
            params![encounter_id.to_string(), tag_id.to_string()],
        )?;
        Ok(())
    }

    pub fn person_tags(&self, person_id: PersonId) -> Result<Vec<TagId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag_id FROM person_tags WHERE person_id = ?1")?;
        let rows = stmt.query_map([person_id.to_string()], |row| parse_id(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |table: &str| -> Result<usize, StoreError> {
            Ok(self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table}"),
                [],
                |row| row.get::<_, i64>(0),
            )? as usize)
        };
        Ok(StoreStats {
            people: count("people")?,
            encounters: count("encounters")?,
            photos: count("encounter_photos")?,
            face_boxes: count("face_boxes")?,
            embeddings: count("embeddings")?,
            tags: count("tags")?,
        })
    }
}

// --- row helpers, shared with reconcile ---

fn ts_to_sql(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts_str(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e: uuid::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: uuid::Error| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            }),
        None => Ok(None),
    }
}

fn gps_from_row(row: &Row<'_>, lat_idx: usize, lon_idx: usize) -> rusqlite::Result<Option<GpsPoint>> {
    let lat: Option<f64> = row.get(lat_idx)?;
    let lon: Option<f64> = row.get(lon_idx)?;
    Ok(match (lat, lon) {
        (Some(latitude), Some(longitude)) => Some(GpsPoint {
            latitude,
            longitude,
        }),
        _ => None,
    })
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    let created_at: String = row.get(11)?;
    let last_seen_at: Option<String> = row.get(12)?;
    Ok(Person {
        id: parse_id(row, 0)?,
        name: row.get(1)?,
        notes: row.get(2)?,
        relationship: row.get(3)?,
        company: row.get(4)?,
        job_title: row.get(5)?,
        context: row.get(6)?,
        favorite: row.get(7)?,
        is_me: row.get(8)?,
        contact_id: row.get(9)?,
        profile_embedding_id: parse_opt_id(row, 10)?,
        created_at: parse_ts_str(11, created_at)?,
        last_seen_at: last_seen_at.map(|s| parse_ts_str(12, s)).transpose()?,
    })
}

fn embedding_from_row(row: &Row<'_>) -> rusqlite::Result<FaceEmbedding> {
    let vector: Vec<u8> = row.get(2)?;
    let model_version: Option<String> = row.get(3)?;
    let created_at: String = row.get(7)?;
    let embedding = Embedding::from_le_bytes(&vector, model_version)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Blob, Box::new(e)))?;
    Ok(FaceEmbedding {
        id: parse_id(row, 0)?,
        person_id: parse_id(row, 1)?,
        embedding,
        crop: row.get(4)?,
        encounter_id: parse_opt_id(row, 5)?,
        face_box_id: parse_opt_id(row, 6)?,
        created_at: parse_ts_str(7, created_at)?,
    })
}

fn box_from_row(row: &Row<'_>) -> rusqlite::Result<FaceBox> {
    Ok(FaceBox {
        id: parse_id(row, 0)?,
        rect: NormRect {
            x: row.get::<_, f64>(1)? as f32,
            y: row.get::<_, f64>(2)? as f32,
            width: row.get::<_, f64>(3)? as f32,
            height: row.get::<_, f64>(4)? as f32,
        },
        person_id: parse_opt_id(row, 5)?,
        person_name: row.get(6)?,
        confidence: row.get::<_, Option<f64>>(7)?.map(|c| c as f32),
        auto_accepted: row.get(8)?,
    })
}

pub(crate) fn insert_person(conn: &Connection, person: &Person) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO people (id, name, notes, relationship, company, job_title, context,
                             favorite, is_me, contact_id, profile_embedding_id, created_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            person.id.to_string(),
            person.name,
            person.notes,
            person.relationship,
            person.company,
            person.job_title,
            person.context,
            person.favorite,
            person.is_me,
            person.contact_id,
            person.profile_embedding_id.map(|e| e.to_string()),
            ts_to_sql(&person.created_at),
            person.last_seen_at.map(|t| ts_to_sql(&t)),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_person(conn: &Connection, id: PersonId) -> Result<Option<Person>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, notes, relationship, company, job_title, context,
                favorite, is_me, contact_id, profile_embedding_id, created_at, last_seen_at
         FROM people WHERE id = ?1",
    )?;
    Ok(stmt
        .query_row([id.to_string()], person_from_row)
        .optional()?)
}

pub(crate) fn update_person_scalars(conn: &Connection, person: &Person) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE people
         SET name = ?1, notes = ?2, relationship = ?3, company = ?4, job_title = ?5,
             context = ?6, favorite = ?7, is_me = ?8, contact_id = ?9,
             profile_embedding_id = ?10, last_seen_at = ?11
         WHERE id = ?12",
        params![
            person.name,
            person.notes,
            person.relationship,
            person.company,
            person.job_title,
            person.context,
            person.favorite,
            person.is_me,
            person.contact_id,
            person.profile_embedding_id.map(|e| e.to_string()),
            person.last_seen_at.map(|t| ts_to_sql(&t)),
            person.id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("person", person.id));
    }
    Ok(())
}

pub(crate) fn insert_encounter_row(
    conn: &Connection,
    encounter: &Encounter,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO encounters (id, occurred_at, occasion, location_name, notes,
                                 latitude, longitude, favorite, thumbnail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            encounter.id.to_string(),
            ts_to_sql(&encounter.occurred_at),
            encounter.occasion,
            encounter.location_name,
            encounter.notes,
            encounter.gps.map(|g| g.latitude),
            encounter.gps.map(|g| g.longitude),
            encounter.favorite,
            encounter.thumbnail,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_encounter(
    conn: &Connection,
    id: EncounterId,
) -> Result<Option<Encounter>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, occurred_at, occasion, location_name, notes, latitude, longitude,
                favorite, thumbnail
         FROM encounters WHERE id = ?1",
    )?;
    let base = stmt
        .query_row([id.to_string()], |row| {
            let occurred_at: String = row.get(1)?;
            Ok(Encounter {
                id: parse_id(row, 0)?,
                occurred_at: parse_ts_str(1, occurred_at)?,
                occasion: row.get(2)?,
                location_name: row.get(3)?,
                notes: row.get(4)?,
                gps: gps_from_row(row, 5, 6)?,
                favorite: row.get(7)?,
                thumbnail: row.get(8)?,
                photos: Vec::new(),
                people: Vec::new(),
                tags: Vec::new(),
            })
        })
        .optional()?;

    let Some(mut encounter) = base else {
        return Ok(None);
    };

    encounter.photos = load_photos_for_encounter(conn, id)?;

    let mut stmt = conn.prepare(
        "SELECT person_id FROM encounter_people WHERE encounter_id = ?1 ORDER BY person_id",
    )?;
    let rows = stmt.query_map([id.to_string()], |row| parse_id(row, 0))?;
    encounter.people = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt =
        conn.prepare("SELECT tag_id FROM encounter_tags WHERE encounter_id = ?1 ORDER BY tag_id")?;
    let rows = stmt.query_map([id.to_string()], |row| parse_id(row, 0))?;
    encounter.tags = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(encounter))
}

pub(crate) fn load_photos_for_encounter(
    conn: &Connection,
    encounter_id: EncounterId,
) -> Result<Vec<EncounterPhoto>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, image, captured_at, latitude, longitude, asset_id
         FROM encounter_photos WHERE encounter_id = ?1 ORDER BY position, id",
    )?;
    let rows = stmt.query_map([encounter_id.to_string()], |row| {
        let captured_at: Option<String> = row.get(2)?;
        Ok(EncounterPhoto {
            id: parse_id(row, 0)?,
            image: row.get(1)?,
            captured_at: captured_at.map(|s| parse_ts_str(2, s)).transpose()?,
            gps: gps_from_row(row, 3, 4)?,
            asset_id: row.get(5)?,
            faces: Vec::new(),
        })
    })?;
    let mut photos = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    for photo in &mut photos {
        photo.faces = load_boxes(conn, photo.id)?;
    }
    Ok(photos)
}

pub(crate) fn load_photo(
    conn: &Connection,
    id: PhotoId,
) -> Result<Option<(EncounterId, EncounterPhoto)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT encounter_id, id, image, captured_at, latitude, longitude, asset_id
         FROM encounter_photos WHERE id = ?1",
    )?;
    let found = stmt
        .query_row([id.to_string()], |row| {
            let captured_at: Option<String> = row.get(3)?;
            Ok((
                parse_id::<EncounterId>(row, 0)?,
                EncounterPhoto {
                    id: parse_id(row, 1)?,
                    image: row.get(2)?,
                    captured_at: captured_at.map(|s| parse_ts_str(3, s)).transpose()?,
                    gps: gps_from_row(row, 4, 5)?,
                    asset_id: row.get(6)?,
                    faces: Vec::new(),
                },
            ))
        })
        .optional()?;

    match found {
        Some((encounter_id, mut photo)) => {
            photo.faces = load_boxes(conn, photo.id)?;
            Ok(Some((encounter_id, photo)))
        }
        None => Ok(None),
    }
}

pub(crate) fn load_boxes(conn: &Connection, photo_id: PhotoId) -> Result<Vec<FaceBox>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, x, y, width, height, person_id, person_name, confidence, auto_accepted
         FROM face_boxes WHERE photo_id = ?1 ORDER BY position, id",
    )?;
    let rows = stmt.query_map([photo_id.to_string()], box_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn insert_photo(
    conn: &Connection,
    encounter_id: EncounterId,
    position: i64,
    photo: &EncounterPhoto,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO encounter_photos (id, encounter_id, position, image, captured_at,
                                       latitude, longitude, asset_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            photo.id.to_string(),
            encounter_id.to_string(),
            position,
            photo.image,
            photo.captured_at.map(|t| ts_to_sql(&t)),
            photo.gps.map(|g| g.latitude),
            photo.gps.map(|g| g.longitude),
            photo.asset_id,
        ],
    )?;
    for (box_position, face) in photo.faces.iter().enumerate() {
        insert_box(conn, photo.id, box_position as i64, face)?;
    }
    Ok(())
}

pub(crate) fn insert_box(
    conn: &Connection,
    photo_id: PhotoId,
    position: i64,
    face: &FaceBox,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO face_boxes (id, photo_id, position, x, y, width, height,
                                 person_id, person_name, confidence, auto_accepted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            face.id.to_string(),
            photo_id.to_string(),
            position,
            face.rect.x as f64,
            face.rect.y as f64,
            face.rect.width as f64,
            face.rect.height as f64,
            face.person_id.map(|p| p.to_string()),
            face.person_name,
            face.confidence.map(|c| c as f64),
            face.auto_accepted,
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_embedding_row(
    conn: &Connection,
    embedding: &FaceEmbedding,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO embeddings (id, person_id, vector, model_version, crop,
                                 encounter_id, face_box_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            embedding.id.to_string(),
            embedding.person_id.to_string(),
            embedding.embedding.to_le_bytes(),
            embedding.embedding.model_version,
            embedding.crop,
            embedding.encounter_id.map(|e| e.to_string()),
            embedding.face_box_id.map(|b| b.to_string()),
            ts_to_sql(&embedding.created_at),
        ],
    )?;
    Ok(())
}

/// Delete one embedding, clearing any profile back-reference pointing at it.
pub(crate) fn delete_embedding_row(conn: &Connection, id: EmbeddingId) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE people SET profile_embedding_id = NULL WHERE profile_embedding_id = ?1",
        [id.to_string()],
    )?;
    conn.execute("DELETE FROM embeddings WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

/// Delete every embedding synthesized from the given box.
pub(crate) fn delete_embeddings_for_box(
    conn: &Connection,
    box_id: FaceBoxId,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE people SET profile_embedding_id = NULL
         WHERE profile_embedding_id IN (SELECT id FROM embeddings WHERE face_box_id = ?1)",
        [box_id.to_string()],
    )?;
    conn.execute(
        "DELETE FROM embeddings WHERE face_box_id = ?1",
        [box_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn photo_encounter(
    conn: &Connection,
    photo_id: PhotoId,
) -> Result<Option<EncounterId>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT encounter_id FROM encounter_photos WHERE id = ?1",
            [photo_id.to_string()],
            |row| parse_id(row, 0),
        )
        .optional()?)
}

pub(crate) fn next_photo_position(
    conn: &Connection,
    encounter_id: EncounterId,
) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM encounter_photos WHERE encounter_id = ?1",
        [encounter_id.to_string()],
        |row| row.get(0),
    )?)
}

/// Recompute an encounter's derived membership from its boxes.
pub(crate) fn sync_encounter_people(
    conn: &Connection,
    encounter_id: EncounterId,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM encounter_people WHERE encounter_id = ?1",
        [encounter_id.to_string()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO encounter_people (encounter_id, person_id)
         SELECT DISTINCT ?1, b.person_id
         FROM face_boxes b
         JOIN encounter_photos p ON p.id = b.photo_id
         WHERE p.encounter_id = ?1 AND b.person_id IS NOT NULL",
        [encounter_id.to_string()],
    )?;
    Ok(())
}

/// Advance last-seen for everyone labeled in the encounter.
pub(crate) fn bump_last_seen_for_encounter(
    conn: &Connection,
    encounter_id: EncounterId,
    when: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE people SET last_seen_at = ?1
         WHERE id IN (SELECT person_id FROM encounter_people WHERE encounter_id = ?2)
           AND (last_seen_at IS NULL OR last_seen_at < ?1)",
        params![ts_to_sql(&when), encounter_id.to_string()],
    )?;
    Ok(())
}
