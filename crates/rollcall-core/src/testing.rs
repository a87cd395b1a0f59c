//! Test doubles shared by the unit tests.

use crate::engine::{EngineError, FaceEngine};
use crate::types::Embedding;
use image::{DynamicImage, GrayImage, Luma};

const FAKE_DIM: usize = 16;

/// Uniform grayscale image whose pixel value selects the identity.
///
/// `0` has no face and `255` makes the engine fail.
pub fn face(identity: u8) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([identity])))
}

pub fn no_face() -> DynamicImage {
    face(0)
}

pub fn broken() -> DynamicImage {
    face(255)
}

/// Engine that maps each identity to its own one-hot embedding.
pub struct FakeEngine {
    calls: usize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self { calls: 0 }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl FaceEngine for FakeEngine {
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EngineError> {
        self.calls += 1;
        let identity = image.to_luma8().get_pixel(0, 0).0[0];
        match identity {
            0 => Err(EngineError::NoFaceDetected),
            255 => Err(EngineError::Backend("model crashed".into())),
            n => {
                let mut values = vec![0.0; FAKE_DIM];
                values[n as usize % FAKE_DIM] = 1.0;
                Ok(Embedding {
                    values,
                    model_version: Some("fake".into()),
                })
            }
        }
    }

    fn model_version(&self) -> Option<&str> {
        Some("fake")
    }
}
