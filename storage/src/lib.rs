pub mod crypto;
pub mod object_store;
pub mod repo;
pub mod snapshot;
pub mod vector_index;
pub mod wal;

pub use object_store::{safe_filename, FsObjectStoreGateway, ObjectStoreError, ObjectStoreGateway};
pub use repo::{MetadataRepository, RepoError};
pub use vector_index::{vector_pk, VectorHit, VectorIndex, VectorIndexError};
