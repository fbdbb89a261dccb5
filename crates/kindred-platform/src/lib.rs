//! kindred-platform — host capabilities consumed by the Kindred engine.
//!
//! The engine never talks to a device photo library, geocoder, or contacts
//! database directly. Hosts implement these traits; the in-memory photo
//! library ships here for tests and offline tooling.

pub mod contacts;
pub mod geocode;
pub mod photo;

pub use contacts::{Contact, ContactsError, ContactsStore};
pub use geocode::{GeocodeError, Geocoder, NullGeocoder};
pub use photo::{
    GpsPoint, LibraryError, MemoryPhotoLibrary, PhotoAsset, PhotoLibrary, TimePreset, TimeWindow,
};
