use crate::pipeline::classifier::{ClassifyError, DefectClassifier};
use crate::pipeline::codec::encode_jpeg_base64;
use crate::pipeline::types::{Classification, Patch};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the batch-inference service.
#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    /// Base URL of the service
    pub base_url: String,
    /// Per-batch request timeout
    pub timeout: Duration,
}

impl Default for HttpClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    /// JPEG patches, base64 encoded
    patches: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    predictions: Vec<Classification>,
}

/// A [`DefectClassifier`] backed by a remote batch-inference service.
///
/// Sends `POST {base_url}/classify` with every patch of the batch and expects
/// one prediction per patch, in order. Failed calls are reported, never retried:
/// the frame is simply picked up again on a later cycle.
pub struct HttpClassifier {
    http: Client,
    config: HttpClassifierConfig,
}

impl HttpClassifier {
    /// Must be called outside of an async context (blocking client).
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifyError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/classify", self.config.base_url.trim_end_matches('/'))
    }
}

impl DefectClassifier for HttpClassifier {
    fn classify(&mut self, patches: &[Patch]) -> Result<Vec<Classification>, ClassifyError> {
        let encoded = patches
            .iter()
            .map(|p| encode_jpeg_base64(&p.image).map_err(|e| ClassifyError::Encode(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let url = self.endpoint();
        tracing::debug!("Classifying {} patches via {}", encoded.len(), url);

        let response = self
            .http
            .post(&url)
            .json(&ClassifyRequest { patches: &encoded })
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    ClassifyError::Unavailable(e.to_string())
                } else {
                    ClassifyError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(ClassifyError::RequestFailed(format!(
                "service returned {}: {}",
                status, body
            )));
        }

        let body: ClassifyResponse = response
            .json()
            .map_err(|e| ClassifyError::InvalidResponse(e.to_string()))?;

        if body.predictions.len() != patches.len() {
            return Err(ClassifyError::Misaligned {
                expected: patches.len(),
                got: body.predictions.len(),
            });
        }

        Ok(body.predictions)
    }
}
