//! Reconciliation: merges, splits, and cascade-safe deletes.
//!
//! Every operation here runs inside a single transaction: fully applied or
//! rolled back, never a user-visible partial state.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use kindred_core::types::{EncounterId, PersonId, PhotoId};
use kindred_platform::GpsPoint;

use crate::model::Person;
use crate::store::{
    insert_encounter_row, load_person, next_photo_position, photo_encounter,
    sync_encounter_people, update_person_scalars, IdentityStore, StoreError,
};
use crate::Encounter;

/// Destination of a photo move.
#[derive(Debug, Clone, Copy)]
pub enum MoveTarget {
    Existing(EncounterId),
    /// Create a fresh encounter seeded from the moved photos' own
    /// date and location.
    New,
}

#[derive(Debug, Clone, Copy)]
pub struct MoveOutcome {
    pub destination: EncounterId,
    /// True when the source encounter emptied out and was deleted.
    pub source_deleted: bool,
}

/// Merge secondary people into `primary`.
///
/// All of the secondaries' embeddings and box labels move to the primary,
/// memberships and tags are unioned, empty scalar fields on the primary are
/// filled from the first secondary that has a value, and the secondaries
/// are deleted. Embedding count is conserved.
pub fn merge_people(
    store: &mut IdentityStore,
    primary_id: PersonId,
    secondaries: &[PersonId],
    combine_notes: bool,
) -> Result<(), StoreError> {
    if secondaries.contains(&primary_id) {
        return Err(StoreError::Invalid(
            "cannot merge a person into themselves".into(),
        ));
    }

    let tx = store.conn.transaction()?;
    let mut primary =
        load_person(&tx, primary_id)?.ok_or_else(|| StoreError::not_found("person", primary_id))?;
    let mut notes = primary.notes.clone();

    for &secondary_id in secondaries {
        let secondary = load_person(&tx, secondary_id)?
            .ok_or_else(|| StoreError::not_found("person", secondary_id))?;

        tx.execute(
            "UPDATE embeddings SET person_id = ?1 WHERE person_id = ?2",
            params![primary_id.to_string(), secondary_id.to_string()],
        )?;
        tx.execute(
            "UPDATE face_boxes SET person_id = ?1, person_name = ?2 WHERE person_id = ?3",
            params![
                primary_id.to_string(),
                primary.name,
                secondary_id.to_string()
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO encounter_people (encounter_id, person_id)
             SELECT encounter_id, ?1 FROM encounter_people WHERE person_id = ?2",
            params![primary_id.to_string(), secondary_id.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO person_tags (person_id, tag_id)
             SELECT ?1, tag_id FROM person_tags WHERE person_id = ?2",
            params![primary_id.to_string(), secondary_id.to_string()],
        )?;

        fill_empty_scalars(&mut primary, &secondary);
        if combine_notes && !secondary.notes.is_empty() {
            if !notes.is_empty() {
                notes.push_str("\n\n");
            }
            notes.push_str(&secondary.notes);
        }
        primary.last_seen_at = match (primary.last_seen_at, secondary.last_seen_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        // Membership and tag rows cascade; embeddings are already moved.
        tx.execute(
            "DELETE FROM people WHERE id = ?1",
            [secondary_id.to_string()],
        )?;
    }

    if combine_notes {
        primary.notes = notes;
    }
    update_person_scalars(&tx, &primary)?;
    tx.commit()?;

    tracing::info!(primary = %primary_id, merged = secondaries.len(), "people merged");
    Ok(())
}

/// Fill empty scalar fields on the primary from a secondary. Never
/// overwrites a non-empty primary value.
fn fill_empty_scalars(primary: &mut Person, secondary: &Person) {
    fn fill(dst: &mut String, src: &str) {
        if dst.is_empty() && !src.is_empty() {
            *dst = src.to_string();
        }
    }
    fill(&mut primary.relationship, &secondary.relationship);
    fill(&mut primary.company, &secondary.company);
    fill(&mut primary.job_title, &secondary.job_title);
    fill(&mut primary.context, &secondary.context);
    if primary.contact_id.is_none() {
        primary.contact_id = secondary.contact_id.clone();
    }
    if primary.profile_embedding_id.is_none() {
        primary.profile_embedding_id = secondary.profile_embedding_id;
    }
}

/// Merge secondary encounters into `primary`.
///
/// Photos move over with their boxes untouched, people and tags are
/// unioned, the primary's scalar metadata wins, and embedding provenance is
/// re-pointed before the secondaries are deleted.
pub fn merge_encounters(
    store: &mut IdentityStore,
    primary_id: EncounterId,
    secondaries: &[EncounterId],
    combine_notes: bool,
) -> Result<(), StoreError> {
    if secondaries.contains(&primary_id) {
        return Err(StoreError::Invalid(
            "cannot merge an encounter into itself".into(),
        ));
    }

    let tx = store.conn.transaction()?;
    let mut notes: String = tx
        .query_row(
            "SELECT notes FROM encounters WHERE id = ?1",
            [primary_id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("encounter", primary_id))?;

    let mut position = next_photo_position(&tx, primary_id)?;

    for &secondary_id in secondaries {
        let secondary_notes: String = tx
            .query_row(
                "SELECT notes FROM encounters WHERE id = ?1",
                [secondary_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("encounter", secondary_id))?;

        let photo_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM encounter_photos WHERE encounter_id = ?1 ORDER BY position, id",
            )?;
            let rows = stmt.query_map([secondary_id.to_string()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for photo_id in photo_ids {
            tx.execute(
                "UPDATE encounter_photos SET encounter_id = ?1, position = ?2 WHERE id = ?3",
                params![primary_id.to_string(), position, photo_id],
            )?;
            position += 1;
        }

        tx.execute(
            "INSERT OR IGNORE INTO encounter_tags (encounter_id, tag_id)
             SELECT ?1, tag_id FROM encounter_tags WHERE encounter_id = ?2",
            params![primary_id.to_string(), secondary_id.to_string()],
        )?;
        // Absorbed content keeps its traceability.
        tx.execute(
            "UPDATE embeddings SET encounter_id = ?1 WHERE encounter_id = ?2",
            params![primary_id.to_string(), secondary_id.to_string()],
        )?;

        if combine_notes && !secondary_notes.is_empty() {
            if !notes.is_empty() {
                notes.push_str("\n\n");
            }
            notes.push_str(&secondary_notes);
        }

        tx.execute(
            "DELETE FROM encounters WHERE id = ?1",
            [secondary_id.to_string()],
        )?;
    }

    if combine_notes {
        tx.execute(
            "UPDATE encounters SET notes = ?1 WHERE id = ?2",
            params![notes, primary_id.to_string()],
        )?;
    }
    sync_encounter_people(&tx, primary_id)?;
    tx.commit()?;

    tracing::info!(primary = %primary_id, merged = secondaries.len(), "encounters merged");
    Ok(())
}

/// Move photos (with their boxes) out of `from` into an existing or new
/// encounter. Deletes the source when it empties out.
pub fn move_photos(
    store: &mut IdentityStore,
    photo_ids: &[PhotoId],
    from: EncounterId,
    to: MoveTarget,
) -> Result<MoveOutcome, StoreError> {
    if photo_ids.is_empty() {
        return Err(StoreError::Invalid("no photos selected".into()));
    }

    let tx = store.conn.transaction()?;

    for &photo_id in photo_ids {
        match photo_encounter(&tx, photo_id)? {
            Some(owner) if owner == from => {}
            Some(_) => {
                return Err(StoreError::Invalid(format!(
                    "photo {photo_id} does not belong to the source encounter"
                )))
            }
            None => return Err(StoreError::not_found("photo", photo_id)),
        }
    }

    let destination = match to {
        MoveTarget::Existing(id) => {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM encounters WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::not_found("encounter", id));
            }
            id
        }
        MoveTarget::New => {
            let (occurred_at, gps) = seed_for_new_encounter(&tx, photo_ids, from)?;
            let mut encounter = Encounter::new(occurred_at);
            encounter.gps = gps;
            insert_encounter_row(&tx, &encounter)?;
            encounter.id
        }
    };

    let mut position = next_photo_position(&tx, destination)?;
    for &photo_id in photo_ids {
        tx.execute(
            "UPDATE encounter_photos SET encounter_id = ?1, position = ?2 WHERE id = ?3",
            params![destination.to_string(), position, photo_id.to_string()],
        )?;
        position += 1;
    }

    sync_encounter_people(&tx, destination)?;
    sync_encounter_people(&tx, from)?;

    let remaining: i64 = tx.query_row(
        "SELECT COUNT(*) FROM encounter_photos WHERE encounter_id = ?1",
        [from.to_string()],
        |row| row.get(0),
    )?;
    let source_deleted = remaining == 0;
    if source_deleted {
        // An encounter with zero photos is meaningless.
        tx.execute(
            "UPDATE embeddings SET encounter_id = NULL WHERE encounter_id = ?1",
            [from.to_string()],
        )?;
        tx.execute("DELETE FROM encounters WHERE id = ?1", [from.to_string()])?;
    }

    tx.commit()?;
    tracing::info!(
        from = %from,
        to = %destination,
        moved = photo_ids.len(),
        source_deleted,
        "photos moved"
    );
    Ok(MoveOutcome {
        destination,
        source_deleted,
    })
}

/// Date and location for an encounter created by a move: the moved photos'
/// earliest capture date (falling back to the source encounter's date) and
/// the first available GPS fix.
fn seed_for_new_encounter(
    conn: &Connection,
    photo_ids: &[PhotoId],
    from: EncounterId,
) -> Result<(DateTime<Utc>, Option<GpsPoint>), StoreError> {
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut gps: Option<GpsPoint> = None;

    for &photo_id in photo_ids {
        let row: Option<(Option<String>, Option<f64>, Option<f64>)> = conn
            .query_row(
                "SELECT captured_at, latitude, longitude FROM encounter_photos WHERE id = ?1",
                [photo_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((captured_at, lat, lon)) = row else {
            continue;
        };
        if let Some(ts) = captured_at {
            if let Ok(ts) = DateTime::parse_from_rfc3339(&ts) {
                let ts = ts.with_timezone(&Utc);
                earliest = Some(earliest.map_or(ts, |e: DateTime<Utc>| e.min(ts)));
            }
        }
        if gps.is_none() {
            if let (Some(latitude), Some(longitude)) = (lat, lon) {
                gps = Some(GpsPoint {
                    latitude,
                    longitude,
                });
            }
        }
    }

    let occurred_at = match earliest {
        Some(ts) => ts,
        None => {
            let ts: String = conn.query_row(
                "SELECT occurred_at FROM encounters WHERE id = ?1",
                [from.to_string()],
                |row| row.get(0),
            )?;
            DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::Invalid(format!("bad encounter date: {e}")))?
        }
    };
    Ok((occurred_at, gps))
}

/// Delete a person, stripping every reference first.
///
/// Afterwards no box carries the id or cached name, no encounter lists the
/// person, and all owned embeddings are gone.
pub fn delete_person(store: &mut IdentityStore, id: PersonId) -> Result<(), StoreError> {
    let tx = store.conn.transaction()?;
    if load_person(&tx, id)?.is_none() {
        return Err(StoreError::not_found("person", id));
    }

    tx.execute(
        "UPDATE face_boxes
         SET person_id = NULL, person_name = NULL, confidence = NULL, auto_accepted = 0
         WHERE person_id = ?1",
        [id.to_string()],
    )?;
    // Embeddings, tag links, and membership rows cascade with the row.
    tx.execute("DELETE FROM people WHERE id = ?1", [id.to_string()])?;
    tx.commit()?;

    tracing::info!(person = %id, "person deleted");
    Ok(())
}

/// Delete an encounter and its photos and boxes.
///
/// Embeddings sourced from it keep their person and lose only the
/// provenance pointer (identity survives, traceability is accepted loss).
pub fn delete_encounter(store: &mut IdentityStore, id: EncounterId) -> Result<(), StoreError> {
    let tx = store.conn.transaction()?;
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM encounters WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::not_found("encounter", id));
    }

    tx.execute(
        "UPDATE embeddings SET encounter_id = NULL WHERE encounter_id = ?1",
        [id.to_string()],
    )?;
    tx.execute("DELETE FROM encounters WHERE id = ?1", [id.to_string()])?;
    tx.commit()?;

    tracing::info!(encounter = %id, "encounter deleted");
    Ok(())
}
