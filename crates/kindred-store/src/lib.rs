//! kindred-store — the persistent identity graph.
//!
//! People, encounters, photos, face boxes, embeddings, and tags live in a
//! single SQLite database. Every mutation runs inside a transaction and the
//! store keeps the cross-entity invariants: encounter membership is derived
//! from face boxes, denormalized person names never drift, and profile
//! embedding references never dangle.

pub mod model;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use model::{
    Encounter, EncounterPhoto, FaceBox, FaceEmbedding, LabelApplication, Person, StoreStats, Tag,
};
pub use reconcile::{MoveOutcome, MoveTarget};
pub use store::{IdentityStore, StoreError};
