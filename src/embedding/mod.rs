//! Pluggable text-to-vector embedding adapter.
//!
//! The crate never ships a concrete embedding model: callers implement
//! [`Embedder`] (or hand a closure to [`ClosureEmbedder`]) to plug in
//! whatever model their host process already has loaded.

use thiserror::Error;

/// Errors an embedder implementation may report.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The embedding backend failed for an implementation-specific reason.
    #[error("embedding failed: {0}")]
    Backend(String),
}

/// Converts text into a fixed-dimensional vector.
pub trait Embedder {
    /// Produces the embedding vector for `text`.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Wraps a closure as an [`Embedder`], for tests and simple integrations
/// that don't want to define a full type.
pub struct ClosureEmbedder<F>(F);

impl<F> ClosureEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, EmbeddingError>,
{
    /// Wraps `f` as an embedder.
    pub fn new(f: F) -> Self {
        ClosureEmbedder(f)
    }
}

impl<F> Embedder for ClosureEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, EmbeddingError>,
{
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (self.0)(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_embedder_forwards_to_closure() {
        let embedder = ClosureEmbedder::new(|text: &str| Ok(vec![text.len() as f32]));
        assert_eq!(embedder.embed("hello").unwrap(), vec![5.0]);
    }

    #[test]
    fn closure_embedder_propagates_errors() {
        let embedder = ClosureEmbedder::new(|_: &str| Err(EmbeddingError::Backend("down".into())));
        assert!(embedder.embed("x").is_err());
    }
}
