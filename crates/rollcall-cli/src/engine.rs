//! Face engine backed by an external program.
//!
//! The frame is written to a temporary PNG and its path appended to the
//! configured command line. The program answers with one JSON object on
//! stdout:
//!
//! ```text
//! {"embedding": [0.12, -0.03, ...], "model": "VGG-Face"}   face found
//! {"embedding": null}                                      no face
//! ```
//!
//! `model` is optional.

use image::{DynamicImage, ImageFormat};
use rollcall_core::{Embedding, EngineError, FaceEngine};
use serde::Deserialize;
use std::process::{Command, Stdio};

#[derive(Debug, Deserialize)]
struct EngineReply {
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    model: Option<String>,
}

/// [`FaceEngine`] that shells out to an embedding command.
pub struct CommandEngine {
    argv: Vec<String>,
    model_version: Option<String>,
}

impl CommandEngine {
    pub fn new(argv: Vec<String>) -> Result<Self, EngineError> {
        if argv.is_empty() {
            return Err(EngineError::Backend(
                "no engine command configured; set engine_command in config.toml or ROLLCALL_ENGINE_COMMAND"
                    .into(),
            ));
        }
        Ok(Self {
            argv,
            model_version: None,
        })
    }
}

impl FaceEngine for CommandEngine {
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EngineError> {
        let mut frame = tempfile::Builder::new()
            .prefix("rollcall-frame-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EngineError::Backend(format!("failed to create temp image: {e}")))?;
        image
            .write_to(&mut frame, ImageFormat::Png)
            .map_err(|e| EngineError::Backend(format!("failed to encode frame: {e}")))?;

        let started = std::time::Instant::now();
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg(frame.path())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Backend(format!("failed to run {}: {e}", self.argv[0])))?;

        tracing::debug!(
            command = %self.argv[0],
            status = %output.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Backend(format!(
                "{} exited with {}: {}",
                self.argv[0],
                output.status,
                stderr.trim()
            )));
        }

        let embedding = parse_reply(&output.stdout)?;
        if let Some(model) = &embedding.model_version {
            if self.model_version.as_ref() != Some(model) {
                tracing::info!(model = %model, "engine model reported");
                self.model_version = Some(model.clone());
            }
        }
        Ok(embedding)
    }

    fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }
}

fn parse_reply(stdout: &[u8]) -> Result<Embedding, EngineError> {
    let reply: EngineReply = serde_json::from_slice(stdout)
        .map_err(|e| EngineError::Backend(format!("unparsable engine output: {e}")))?;

    match reply.embedding {
        None => Err(EngineError::NoFaceDetected),
        Some(values) if values.is_empty() => Err(EngineError::Backend("engine returned an empty embedding".into())),
        Some(values) if values.iter().any(|v| !v.is_finite()) => {
            Err(EngineError::Backend("engine returned a non-finite embedding".into()))
        }
        Some(values) => Ok(Embedding {
            values,
            model_version: reply.model,
        }),
    }
}
