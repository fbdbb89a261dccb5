//! Contacts database capability.
//!
//! A person record may carry an opaque `contact_id` linking it to the host's
//! contacts database. The engine only reads contact display data and pushes
//! face crops as contact photos; everything else about contacts is host
//! territory.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContactsError {
    #[error("contacts access denied")]
    AccessDenied,
    #[error("contacts store unavailable: {0}")]
    Unavailable(String),
}

/// A contact as the host exposes it.
#[derive(Debug, Clone)]
pub struct Contact {
    pub identifier: String,
    pub full_name: String,
    pub has_photo: bool,
}

/// Host contacts database.
pub trait ContactsStore {
    /// Ask the host for access. Returns whether access is granted.
    fn request_access(&self) -> impl std::future::Future<Output = bool> + Send;

    fn fetch(
        &self,
        identifier: &str,
    ) -> impl std::future::Future<Output = Result<Option<Contact>, ContactsError>> + Send;

    /// Replace the contact's photo with the given compressed image bytes.
    fn set_photo(
        &self,
        identifier: &str,
        image: &[u8],
    ) -> impl std::future::Future<Output = Result<(), ContactsError>> + Send;
}
