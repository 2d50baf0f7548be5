//! External conformance validation
//!
//! Provides the [`ConformanceValidator`] seam and an HTTP implementation.
//! Callers go through [`run_bounded`], which applies the timeout and turns
//! every failure into an unavailable outcome; the orchestrator treats that
//! as invalid.

use crate::types::ValidatorReport;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Validator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorError {
    /// Validator unreachable, crashed or answered with an error status
    #[error("validator unavailable: {0}")]
    Unavailable(String),

    /// Validator did not answer in time
    #[error("validator timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Answer was not a validation report
    #[error("invalid validator response: {0}")]
    InvalidResponse(String),
}

/// Schema and model validation of a serialized candidate
#[async_trait]
pub trait ConformanceValidator: Send + Sync {
    /// Validate `candidate` (canonical JSON bytes)
    async fn validate(&self, candidate: &[u8]) -> Result<ValidatorReport, ValidatorError>;
}

/// Validator behind an HTTP endpoint
///
/// POSTs the candidate as `application/json` and expects a
/// [`ValidatorReport`] back.
#[derive(Debug, Clone)]
pub struct HttpValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpValidator {
    /// Create validator for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Use a preconfigured client
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Endpoint
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConformanceValidator for HttpValidator {
    async fn validate(&self, candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(candidate.to_vec())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ValidatorError::Unavailable(e.to_string()))?;
        response
            .json::<ValidatorReport>()
            .await
            .map_err(|e| ValidatorError::InvalidResponse(e.to_string()))
    }
}

/// Stand-in when no validator is configured; always unavailable
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl ConformanceValidator for Unconfigured {
    async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        Err(ValidatorError::Unavailable(
            "no validator configured".to_string(),
        ))
    }
}

/// Run `validator` with a `timeout`
///
/// # Errors
/// Returns the validator's error, or [`ValidatorError::Timeout`]
pub async fn run_bounded(
    validator: &dyn ConformanceValidator,
    candidate: &[u8],
    timeout: Duration,
) -> Result<ValidatorReport, ValidatorError> {
    let result = match tokio::time::timeout(timeout, validator.validate(candidate)).await {
        Ok(result) => result,
        Err(_) => Err(ValidatorError::Timeout(timeout)),
    };
    if let Err(e) = &result {
        warn!(error = %e, "external validation unavailable; treating as invalid");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy(Duration);

    #[async_trait]
    impl ConformanceValidator for Sleepy {
        async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
            tokio::time::sleep(self.0).await;
            Ok(ValidatorReport::passing())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_validator_times_out() {
        let timeout = Duration::from_millis(100);
        let result = run_bounded(&Sleepy(Duration::from_secs(5)), b"{}", timeout).await;
        assert_eq!(result, Err(ValidatorError::Timeout(timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_validator_answers() {
        let result = run_bounded(
            &Sleepy(Duration::from_millis(10)),
            b"{}",
            Duration::from_secs(1),
        )
        .await;
        assert!(result.unwrap().is_valid());
    }

    #[tokio::test]
    async fn unconfigured_is_unavailable() {
        let result = run_bounded(&Unconfigured, b"{}", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ValidatorError::Unavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        // Port 9 (discard) on loopback refuses connections
        let validator = HttpValidator::new("http://127.0.0.1:9/validate");
        let result = run_bounded(&validator, b"{}", Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(ValidatorError::Unavailable(_) | ValidatorError::Timeout(_))
        ));
    }
}
