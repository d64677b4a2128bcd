//! Tool catalog storage and search indexing.

pub mod index;
pub mod types;

pub use index::CatalogIndex;
pub use types::{QualifiedActionName, SearchHit, ToolDescriptor};
