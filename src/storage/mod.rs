mod snapshot;
mod store;

pub use snapshot::SnapshotWriter;
pub use store::{EventStore, JsonlEventStore, MemoryEventStore, StoredPath};
