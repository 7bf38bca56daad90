//! Generation API client abstraction
//!
//! Wraps the remote image-generation API behind an `ImageGenerator` trait:
//! - `GeminiImageClient` talks to a Gemini-style generateContent endpoint
//! - `MockImageGenerator` for tests and local development
//!
//! The client requests exactly one image per call; callers needing N images
//! make N sequential calls. Response classification and the retry/backoff
//! discipline (server retry hints, quota fast-failure, jitter) live here.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// One generated image
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// A reference image sent as inline conditioning data
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Typed failures from the generation API
#[derive(Debug, Error)]
pub enum GenApiError {
    /// Network failure or 5xx: transient, retried with exponential backoff
    #[error("Upstream generation error: {message}")]
    Upstream { message: String },

    /// 429 with a usable allowance left: retried after the server delay
    #[error("Rate limited by generation API")]
    RateLimited { retry_after: Duration },

    /// 429 reporting a quota limit of zero: retrying would burn attempts
    /// against an allowance that will not reset soon
    #[error("Generation quota exhausted")]
    QuotaExhausted,

    /// 2xx carrying text instead of an image: model/config mismatch
    #[error("Model returned text instead of an image: {message}")]
    CapabilityMismatch { message: String },

    /// Anything else the API sent that we cannot act on
    #[error("Invalid response from generation API: {message}")]
    InvalidResponse { message: String },
}

impl GenApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenApiError::Upstream { .. } | GenApiError::RateLimited { .. }
        )
    }
}

/// Trait for image generation
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate a single image from reference images and a prompt
    async fn generate(
        &self,
        reference_images: &[ReferenceImage],
        prompt: &str,
        aspect_ratio: &str,
    ) -> Result<GeneratedImage, GenApiError>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineData>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

/// Pull the image out of a 2xx response body, or classify the miss.
fn extract_image(response: GenerateContentResponse) -> Result<GeneratedImage, GenApiError> {
    let parts = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.content)
        .and_then(|c| c.parts)
        .unwrap_or_default();

    let mut text_payload = None;

    for part in parts {
        if let Some(inline) = part.inline_data {
            if let Some(data) = inline.data {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| GenApiError::InvalidResponse {
                        message: format!("Image payload is not valid base64: {}", e),
                    })?;

                return Ok(GeneratedImage {
                    bytes,
                    mime_type: inline.mime_type.unwrap_or_else(|| "image/png".to_string()),
                });
            }
        }
        if text_payload.is_none() {
            text_payload = part.text;
        }
    }

    // Text instead of an image means the configured model cannot produce
    // images, not that the service is overloaded.
    match text_payload {
        Some(text) => Err(GenApiError::CapabilityMismatch {
            message: text.chars().take(200).collect(),
        }),
        None => Err(GenApiError::InvalidResponse {
            message: "Response carried neither image nor text payload".to_string(),
        }),
    }
}

/// Parse a protobuf-style duration string like "17s" or "3.5s".
fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    if seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Classify a 429 body + Retry-After header into a typed error.
///
/// Hint priority: structured RetryInfo detail, then the Retry-After header,
/// then the configured fallback. A quota limit of exactly zero is reported
/// as `QuotaExhausted` instead.
fn classify_rate_limit(
    body: &str,
    retry_after_header: Option<&str>,
    fallback: Duration,
) -> GenApiError {
    let envelope: ApiErrorEnvelope = serde_json::from_str(body).unwrap_or(ApiErrorEnvelope {
        error: None,
    });

    let mut hint = None;
    let mut quota_exhausted = false;

    if let Some(error) = &envelope.error {
        for detail in &error.details {
            let type_url = detail
                .get("@type")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            if type_url.ends_with("RetryInfo") {
                hint = detail
                    .get("retryDelay")
                    .and_then(|v| v.as_str())
                    .and_then(parse_retry_delay);
            } else if type_url.ends_with("QuotaFailure") {
                let violations = detail
                    .get("violations")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                quota_exhausted = violations.iter().any(|v| {
                    v.get("quotaValue").and_then(|q| q.as_str()) == Some("0")
                });
            }
        }

        if error
            .message
            .as_deref()
            .map(|m| m.contains("limit: 0"))
            .unwrap_or(false)
        {
            quota_exhausted = true;
        }
    }

    if quota_exhausted {
        return GenApiError::QuotaExhausted;
    }

    let retry_after = hint
        .or_else(|| {
            retry_after_header
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        })
        .unwrap_or(fallback);

    GenApiError::RateLimited { retry_after }
}

/// Delay before the next attempt, without jitter.
///
/// Always within [0, policy.max_delay] regardless of hint source: server
/// hints are clamped, backoff is capped.
pub fn retry_wait(policy: &RetryPolicy, error: &GenApiError, attempt: u32) -> Duration {
    match error {
        GenApiError::RateLimited { retry_after } => policy.clamp_hint(*retry_after),
        _ => policy.backoff_delay(attempt),
    }
}

// ============================================================================
// Gemini client
// ============================================================================

/// Client for a Gemini-style generateContent image endpoint
pub struct GeminiImageClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    policy: RetryPolicy,
    rate_limit_fallback: Duration,
}

impl GeminiImageClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        timeout: Duration,
        policy: RetryPolicy,
        rate_limit_fallback: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| "gemini-2.0-flash-exp-image-generation".to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            policy,
            rate_limit_fallback,
        }
    }

    async fn request_once(
        &self,
        reference_images: &[ReferenceImage],
        prompt: &str,
        aspect_ratio: &str,
    ) -> Result<GeneratedImage, GenApiError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );

        let mut parts: Vec<serde_json::Value> = reference_images
            .iter()
            .map(|image| {
                json!({
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                    }
                })
            })
            .collect();
        parts.push(json!({ "text": prompt }));

        let body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": aspect_ratio },
            },
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenApiError::Upstream {
                message: format!("Request failed: {}", e),
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_header = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rate_limit(
                &body,
                retry_after_header.as_deref(),
                self.rate_limit_fallback,
            ));
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenApiError::Upstream {
                message: format!("API error {}: {}", status, body),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenApiError::InvalidResponse {
                message: format!("API error {}: {}", status, body),
            });
        }

        let parsed: GenerateContentResponse =
            response
                .json()
                .await
                .map_err(|e| GenApiError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        extract_image(parsed)
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    async fn generate(
        &self,
        reference_images: &[ReferenceImage],
        prompt: &str,
        aspect_ratio: &str,
    ) -> Result<GeneratedImage, GenApiError> {
        let mut attempt = 0;

        loop {
            match self
                .request_once(reference_images, prompt, aspect_ratio)
                .await
            {
                Ok(image) => return Ok(image),
                Err(error) => {
                    attempt += 1;
                    if !error.is_retryable() || !self.policy.attempts_remain(attempt) {
                        return Err(error);
                    }

                    let delay = self.policy.with_jitter(retry_wait(&self.policy, &error, attempt - 1));
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Generation request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Mock generator for tests and local development.
///
/// Succeeds with a tiny PNG by default; scripted outcomes can be queued to
/// exercise failure paths.
pub struct MockImageGenerator {
    outcomes: Mutex<VecDeque<Result<GeneratedImage, GenApiError>>>,
}

/// Smallest well-formed PNG header, good enough for fixtures
const MOCK_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52,
];

impl MockImageGenerator {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue outcomes returned in order; once drained, calls succeed.
    pub fn with_outcomes(outcomes: Vec<Result<GeneratedImage, GenApiError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }

    fn success() -> GeneratedImage {
        GeneratedImage {
            bytes: MOCK_PNG.to_vec(),
            mime_type: "image/png".to_string(),
        }
    }
}

impl Default for MockImageGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(
        &self,
        _reference_images: &[ReferenceImage],
        _prompt: &str,
        _aspect_ratio: &str,
    ) -> Result<GeneratedImage, GenApiError> {
        let scripted = self.outcomes.lock().expect("mock lock poisoned").pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(Self::success()),
        }
    }

    fn model_name(&self) -> &str {
        "mock-image-model"
    }
}

/// Create a generator based on configuration
pub fn create_generator(
    provider: &str,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    timeout: Duration,
    policy: RetryPolicy,
    rate_limit_fallback: Duration,
) -> Arc<dyn ImageGenerator> {
    match provider {
        "gemini" => {
            let key = api_key.expect("Generation API key required");
            Arc::new(GeminiImageClient::new(
                key,
                model,
                base_url,
                timeout,
                policy,
                rate_limit_fallback,
            ))
        }
        "mock" => Arc::new(MockImageGenerator::new()),
        _ => {
            tracing::warn!(provider = provider, "Unknown generation provider, using mock");
            Arc::new(MockImageGenerator::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_parse_retry_delay() {
        assert_eq!(parse_retry_delay("17s"), Some(Duration::from_secs(17)));
        assert_eq!(parse_retry_delay("3.5s"), Some(Duration::from_millis(3500)));
        assert_eq!(parse_retry_delay("0s"), Some(Duration::ZERO));
        assert_eq!(parse_retry_delay("17"), None);
        assert_eq!(parse_retry_delay("soon"), None);
        assert_eq!(parse_retry_delay("-5s"), None);
    }

    #[test]
    fn test_structured_hint_beats_header() {
        let body = r#"{"error":{"code":429,"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"17s"}
        ]}}"#;

        let error = classify_rate_limit(body, Some("99"), Duration::from_secs(30));
        match error {
            GenApiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(17));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_header_beats_fallback() {
        let error = classify_rate_limit("{}", Some("42"), Duration::from_secs(30));
        match error {
            GenApiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(42));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_when_no_hint() {
        let error = classify_rate_limit("not json", None, Duration::from_secs(30));
        match error {
            GenApiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_quota_exhausted_from_violation() {
        let body = r#"{"error":{"code":429,"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure",
             "violations":[{"quotaMetric":"generate_requests","quotaValue":"0"}]}
        ]}}"#;

        let error = classify_rate_limit(body, None, Duration::from_secs(30));
        assert!(matches!(error, GenApiError::QuotaExhausted));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_quota_exhausted_from_message() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded, limit: 0"}}"#;
        let error = classify_rate_limit(body, Some("10"), Duration::from_secs(30));
        assert!(matches!(error, GenApiError::QuotaExhausted));
    }

    #[test]
    fn test_nonzero_quota_still_rate_limited() {
        let body = r#"{"error":{"code":429,"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure",
             "violations":[{"quotaMetric":"generate_requests","quotaValue":"60"}]}
        ]}}"#;

        let error = classify_rate_limit(body, None, Duration::from_secs(30));
        assert!(matches!(error, GenApiError::RateLimited { .. }));
    }

    #[test]
    fn test_retry_wait_bounds() {
        let policy = policy();

        // Oversized server hint is clamped to the cap
        let wait = retry_wait(
            &policy,
            &GenApiError::RateLimited {
                retry_after: Duration::from_secs(3600),
            },
            0,
        );
        assert_eq!(wait, policy.max_delay);

        // Backoff path stays within bounds for any attempt
        for attempt in 0..10 {
            let wait = retry_wait(
                &policy,
                &GenApiError::Upstream {
                    message: "503".into(),
                },
                attempt,
            );
            assert!(wait <= policy.max_delay);
        }
    }

    #[test]
    fn test_extract_image_camel_case() {
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[
                {{"inlineData":{{"mimeType":"image/png","data":"{}"}}}}
            ]}}}}]}}"#,
            base64::engine::general_purpose::STANDARD.encode(b"fake-png")
        );

        let parsed: GenerateContentResponse = serde_json::from_str(&body).unwrap();
        let image = extract_image(parsed).unwrap();
        assert_eq!(image.bytes, b"fake-png");
        assert_eq!(image.mime_type, "image/png");
    }

    #[test]
    fn test_extract_image_snake_case_fallback() {
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[
                {{"inline_data":{{"mime_type":"image/jpeg","data":"{}"}}}}
            ]}}}}]}}"#,
            base64::engine::general_purpose::STANDARD.encode(b"fake-jpeg")
        );

        let parsed: GenerateContentResponse = serde_json::from_str(&body).unwrap();
        let image = extract_image(parsed).unwrap();
        assert_eq!(image.bytes, b"fake-jpeg");
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[test]
    fn test_text_only_response_is_capability_mismatch() {
        let body = r#"{"candidates":[{"content":{"parts":[
            {"text":"I cannot generate images with this model."}
        ]}}]}"#;

        let parsed: GenerateContentResponse = serde_json::from_str(body).unwrap();
        let error = extract_image(parsed).unwrap_err();
        assert!(matches!(error, GenApiError::CapabilityMismatch { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_empty_response_is_invalid() {
        let parsed: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            extract_image(parsed),
            Err(GenApiError::InvalidResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_generator_default_succeeds() {
        let generator = MockImageGenerator::new();
        let image = generator.generate(&[], "portrait", "1:1").await.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert!(!image.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_mock_generator_scripted_outcomes() {
        let generator = MockImageGenerator::with_outcomes(vec![
            Err(GenApiError::QuotaExhausted),
        ]);

        assert!(matches!(
            generator.generate(&[], "portrait", "1:1").await,
            Err(GenApiError::QuotaExhausted)
        ));
        // Drained: back to success
        assert!(generator.generate(&[], "portrait", "1:1").await.is_ok());
    }
}
