//! Document loading and character chunking.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::RetrievalError;

/// A loaded markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
}

impl Document {
    /// File name used to cite the document.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One chunk of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub doc_name: String,
    pub chunk_index: usize,
    pub text: String,
}

/// Chunk sizes, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_chars() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    200
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkConfig {
    /// Reject sizes that would never advance.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.chunk_chars == 0 || self.chunk_overlap >= self.chunk_chars {
            return Err(RetrievalError::InvalidChunking {
                chunk_chars: self.chunk_chars,
                chunk_overlap: self.chunk_overlap,
            });
        }
        Ok(())
    }
}

/// Load every `*.md` file directly under `dir`, sorted by file name.
pub fn load_documents(dir: &Path) -> Result<Vec<Document>, RetrievalError> {
    let io_err = |e: std::io::Error| RetrievalError::Io {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|e| RetrievalError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        docs.push(Document { path, text });
    }

    tracing::info!(dir = %dir.display(), count = docs.len(), "loaded documents");
    Ok(docs)
}

/// Character-based chunking with overlap.
///
/// Works on chars, not bytes, so multi-byte text never splits mid-character.
/// Sizes that would never advance are rejected with `InvalidChunking`.
pub fn chunk_text(text: &str, config: ChunkConfig) -> Result<Vec<String>, RetrievalError> {
    config.validate()?;
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let end = (start + config.chunk_chars).min(n);
        chunks.push(chars[start..end].iter().collect());
        if end == n {
            break;
        }
        start = end - config.chunk_overlap;
    }

    Ok(chunks)
}

/// Load and chunk every document in `dir`.
pub fn load_and_chunk_all(dir: &Path, config: ChunkConfig) -> Result<Vec<Chunk>, RetrievalError> {
    config.validate()?;
    let mut all = Vec::new();
    for doc in load_documents(dir)? {
        let name = doc.name();
        for (chunk_index, text) in chunk_text(&doc.text, config)?.into_iter().enumerate() {
            all.push(Chunk {
                doc_name: name.clone(),
                chunk_index,
                text,
            });
        }
    }
    Ok(all)
}
