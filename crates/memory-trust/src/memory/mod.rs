//! Memory entries, their durable store and the portfolio exchange format.

mod entry;
pub mod portfolio;
mod store;

pub use entry::{
    content_hash, AppendMetadata, EntryId, MemoryEntry, PrivacyLevel, TrustLevel, ValidationStamp,
};
pub use store::{LoadFilter, MemoryStore, StoreEvent, UpdateOrigin, ValidationUpdate};
