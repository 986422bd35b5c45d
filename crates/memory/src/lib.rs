pub mod episodic;
pub mod extract;
pub mod graph;
pub mod procedural;
pub mod semantic;
pub mod store;
pub mod subsystem;
pub mod value;
pub mod vector;
pub mod working;

pub use episodic::{EpisodicStore, Interaction};
pub use extract::{cosine_similarity, extract_concepts};
pub use graph::{ConceptEdge, ConceptGraph, ConceptNode, GraphSnapshot};
pub use procedural::{ProceduralStore, Recipe, RecipeOp};
pub use semantic::{ScoredSnippet, SemanticStore};
pub use store::{BaseStore, MemoryStore};
pub use subsystem::{
    MemoryStats, MemorySubsystem, RetrieveOptions, RetrieveOutcome, ScoredMemory, StoreKeys,
};
pub use value::{MemoryItem, Value};
pub use vector::{
    Embedder, HashEmbedder, InMemoryVectorStore, SqliteVectorStore, VectorError, VectorHit,
    VectorStore, create_vector_store,
};
pub use working::WorkingMemory;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Vector(#[from] vector::VectorError),

    #[error(transparent)]
    Persistence(#[from] sentra_vault::VaultError),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
