//! Message archival formats.
//!
//! Each consumed message is archived as a single JSON object. The object's key is derived
//! purely from the message's coordinates, so re-archiving a redelivered message overwrites the
//! same object.

mod key;
mod record;

pub use key::ArchiveKey;
pub use record::ArchiveRecord;
