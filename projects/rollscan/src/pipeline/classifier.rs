// Defect classifier boundary.
//
// The model itself lives outside this process. The pipeline only depends on
// `DefectClassifier`, which batch-classifies patches and returns one
// `Classification` per input patch, index for index.

use crate::pipeline::types::{Classification, DefectClass, Patch};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Classification request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),

    #[error("Classifier returned {got} predictions for {expected} patches")]
    Misaligned { expected: usize, got: usize },

    #[error("Classifier returned unknown class id {0}")]
    UnknownClass(u32),

    #[error("Failed to encode patch: {0}")]
    Encode(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub trait DefectClassifier: Send {
    /// Classify a batch of patches. The result is aligned with the input.
    fn classify(&mut self, patches: &[Patch]) -> Result<Vec<Classification>, ClassifyError>;
}

/// Run a batch and enforce the classifier contract: output aligned with the
/// input, known class ids, confidences in `[0, 1]`.
pub fn classify_checked(
    classifier: &mut dyn DefectClassifier,
    patches: &[Patch],
) -> Result<Vec<(DefectClass, f32)>, ClassifyError> {
    if patches.is_empty() {
        return Ok(Vec::new());
    }

    let predictions = classifier.classify(patches)?;
    if predictions.len() != patches.len() {
        return Err(ClassifyError::Misaligned {
            expected: patches.len(),
            got: predictions.len(),
        });
    }

    predictions
        .into_iter()
        .map(|p| {
            let class =
                DefectClass::from_id(p.class_id).ok_or(ClassifyError::UnknownClass(p.class_id))?;
            if !(0.0..=1.0).contains(&p.confidence) {
                return Err(ClassifyError::InvalidResponse(format!(
                    "confidence {} outside [0, 1]",
                    p.confidence
                )));
            }
            Ok((class, p.confidence))
        })
        .collect()
}
