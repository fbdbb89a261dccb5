//! Contact-link glue: push a person's canonical face crop to their linked
//! contact.

use kindred_core::types::PersonId;
use kindred_platform::{ContactsError, ContactsStore};
use kindred_store::IdentityStore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContactSyncError {
    #[error("person has no linked contact")]
    NotLinked,
    #[error("person has no profile face sample")]
    NoProfileCrop,
    #[error("store: {0}")]
    Store(#[from] kindred_store::StoreError),
    #[error("contacts: {0}")]
    Contacts(#[from] ContactsError),
    #[error("person not found: {0}")]
    PersonNotFound(PersonId),
}

/// Push the person's profile face crop as their contact photo.
///
/// Uses the profile embedding's stored crop; falls back to the person's
/// newest sample when no profile is chosen.
pub async fn push_contact_photo<C: ContactsStore>(
    store: &IdentityStore,
    contacts: &C,
    person_id: PersonId,
) -> Result<(), ContactSyncError> {
    let person = store
        .person(person_id)?
        .ok_or(ContactSyncError::PersonNotFound(person_id))?;
    let contact_id = person.contact_id.ok_or(ContactSyncError::NotLinked)?;

    let samples = store.embeddings_for_person(person_id)?;
    let crop = samples
        .iter()
        .find(|s| Some(s.id) == person.profile_embedding_id)
        .or_else(|| samples.last())
        .and_then(|s| s.crop.clone())
        .ok_or(ContactSyncError::NoProfileCrop)?;

    contacts.set_photo(&contact_id, &crop).await?;
    tracing::info!(person = %person_id, contact = %contact_id, "contact photo updated");
    Ok(())
}
