pub mod lexical;
pub mod redb_store;
pub mod traits;
pub mod vector;

pub use lexical::{Bm25Config, Bm25Scorer};
pub use redb_store::{RedbGraphStore, CURRENT_SCHEMA_VERSION};
pub use traits::{CascadeReport, GraphStore, Neighborhood, StoreStats};
pub use vector::{KnnIndex, Neighbor};
