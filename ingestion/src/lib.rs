pub mod chunker;
pub mod extract;

pub use chunker::{chunk_splitter_for_strategy, ChunkSplitter};
pub use extract::{detect_content_kind, ContentKind, ExtractError};
