//! kindred-engine — the face-identity pipeline behind the app.
//!
//! One engine thread owns the identity store and the detection/embedding
//! models; async flows (scanning, labeling, re-detection, reconciliation)
//! talk to it through a cloneable handle. The scan session clusters library
//! photos into candidate encounters and keeps "Continue" resumable.

pub mod contacts;
mod labeler;
pub mod locate;
mod redetect;
pub mod scan;
pub mod service;
pub mod settings;

#[cfg(test)]
mod test_support;

pub use contacts::{push_contact_photo, ContactSyncError};
pub use locate::{LocateEvent, LocateFailure, LocateState};
pub use scan::{
    PhotoGroup, ScanError, ScanHarvest, ScanProgress, ScanSession, ScanToken, ScannedFace,
    ScannedPhoto,
};
pub use service::{
    spawn_service, AnalyzedFace, LabelOutcome, LabelTarget, PropagatedFace, RedetectOutcome,
    ServiceError, ServiceHandle,
};
pub use settings::Settings;
