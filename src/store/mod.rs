pub mod object_store;
pub mod partition_store;

pub use object_store::{InMemoryObjectStore, LocalObjectStore, ObjectStore};
pub use partition_store::{PartitionStore, RawManifest, StoreStage};
