//! Retrieval — RAG over local markdown documents.
//!
//! - `loader`: load `*.md` files and split them into overlapping chunks
//! - `embedder`: `Embedder` trait and the HTTP implementation
//! - `store`: in-memory vector store with cosine top-k
//! - `rag`: build the index and answer questions from it

pub mod embedder;
pub mod errors;
pub mod loader;
pub mod rag;
pub mod store;

pub use embedder::{Embedder, HttpEmbedder};
pub use errors::RetrievalError;
pub use loader::{chunk_text, Chunk, ChunkConfig};
pub use rag::{RagAnswer, RagConfig, RagEngine};
pub use store::VectorStore;
