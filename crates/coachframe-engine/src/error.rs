use std::path::PathBuf;

use thiserror::Error;

/// The judge could not produce a verdict. Never consumes an iteration.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge request failed: {0:#}")]
    Request(#[source] anyhow::Error),
    #[error("judge response was not usable: {0}")]
    Malformed(String),
    #[error("could not prepare image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
}

/// Refinement failed; callers fall back to the prompt they already have.
#[derive(Debug, Error)]
pub enum RefinerError {
    #[error("refiner request failed: {0:#}")]
    Request(#[source] anyhow::Error),
    #[error("refiner returned an empty prompt")]
    Empty,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("image edit request failed: {0:#}")]
    Request(#[source] anyhow::Error),
    #[error("{provider} returned no images")]
    NoImages { provider: String },
    #[error("image edit service rejected the request ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("could not store generated image at {path}: {reason}")]
    Store { path: PathBuf, reason: String },
}
