//! SQLite schema.

/// Initial schema, applied idempotently on open.
///
/// `face_boxes.person_id` deliberately has no foreign key: person references
/// on boxes are cleared in code (inside the same transaction that deletes or
/// merges the person) so the denormalized `person_name` is cleared with
/// them.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    relationship TEXT NOT NULL DEFAULT '',
    company TEXT NOT NULL DEFAULT '',
    job_title TEXT NOT NULL DEFAULT '',
    context TEXT NOT NULL DEFAULT '',
    favorite INTEGER NOT NULL DEFAULT 0,
    is_me INTEGER NOT NULL DEFAULT 0,
    contact_id TEXT,
    profile_embedding_id TEXT,
    created_at TEXT NOT NULL,
    last_seen_at TEXT
);

CREATE TABLE IF NOT EXISTS encounters (
    id TEXT PRIMARY KEY,
    occurred_at TEXT NOT NULL,
    occasion TEXT NOT NULL DEFAULT '',
    location_name TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    latitude REAL,
    longitude REAL,
    favorite INTEGER NOT NULL DEFAULT 0,
    thumbnail BLOB
);

-- Derived membership, materialized for queries and resynced from face
-- boxes after every box mutation.
CREATE TABLE IF NOT EXISTS encounter_people (
    encounter_id TEXT NOT NULL REFERENCES encounters(id) ON DELETE CASCADE,
    person_id TEXT NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    PRIMARY KEY (encounter_id, person_id)
);

CREATE TABLE IF NOT EXISTS encounter_photos (
    id TEXT PRIMARY KEY,
    encounter_id TEXT NOT NULL REFERENCES encounters(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    image BLOB NOT NULL,
    captured_at TEXT,
    latitude REAL,
    longitude REAL,
    asset_id TEXT
);

CREATE TABLE IF NOT EXISTS face_boxes (
    id TEXT PRIMARY KEY,
    photo_id TEXT NOT NULL REFERENCES encounter_photos(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    width REAL NOT NULL,
    height REAL NOT NULL,
    person_id TEXT,
    person_name TEXT,
    confidence REAL,
    auto_accepted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    person_id TEXT NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    vector BLOB NOT NULL,
    model_version TEXT,
    crop BLOB,
    encounter_id TEXT,
    face_box_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    color TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS person_tags (
    person_id TEXT NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (person_id, tag_id)
);

CREATE TABLE IF NOT EXISTS encounter_tags (
    encounter_id TEXT NOT NULL REFERENCES encounters(id) ON DELETE CASCADE,
    tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (encounter_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_photos_encounter ON encounter_photos (encounter_id, position);
CREATE INDEX IF NOT EXISTS idx_photos_asset ON encounter_photos (asset_id);
CREATE INDEX IF NOT EXISTS idx_boxes_photo ON face_boxes (photo_id, position);
CREATE INDEX IF NOT EXISTS idx_boxes_person ON face_boxes (person_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_person ON embeddings (person_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_box ON embeddings (face_box_id);
"#;
