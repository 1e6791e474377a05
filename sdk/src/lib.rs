pub mod lifecycle;

pub use lifecycle::{
    ChunkUpdate, DocumentLifecycleService, LifecycleConfig, LifecycleError, ListFilter, Page,
};
