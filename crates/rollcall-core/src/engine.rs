//! Face engine capability.
//!
//! Face detection and embedding are delegated to an external model. The rest
//! of the crate only sees this trait, so the concrete backend is swappable.

use crate::types::Embedding;
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face engine failed: {0}")]
    Backend(String),
}

/// Opaque face-recognition capability.
pub trait FaceEngine {
    /// Detect the dominant face in `image` and return its embedding.
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EngineError>;

    /// Similarity between two embeddings. Higher = more similar.
    fn compare(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.similarity(b)
    }

    /// Label of the model behind this engine, if known.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

impl<E: FaceEngine + ?Sized> FaceEngine for Box<E> {
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EngineError> {
        (**self).embed(image)
    }

    fn compare(&self, a: &Embedding, b: &Embedding) -> f32 {
        (**self).compare(a, b)
    }

    fn model_version(&self) -> Option<&str> {
        (**self).model_version()
    }
}
