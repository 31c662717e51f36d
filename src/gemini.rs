//! Gemini API client shared by the classifier and the justification
//! evaluator.
//!
//! Uses a long-lived reqwest::Client for connection pooling. Callers are
//! expected to wrap `generate` in their own deadline; the client itself
//! only bounds the raw HTTP request.

use crate::error::CompanionError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        }
    }

    /// Generate a response for `prompt` under `system_prompt`.
    pub async fn generate(
        &self,
        system_prompt: &str,
        prompt: &str,
    ) -> crate::Result<(String, f32)> {
        if self.api_key.is_empty() {
            return Err(CompanionError::Upstream(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            error!("Gemini API request failed: {}", e);
            CompanionError::Upstream(format!("Gemini API error: {}", e))
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(CompanionError::Upstream(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            CompanionError::Upstream(format!("Gemini parse error: {}", e))
        })?;

        if gemini_response.candidates.is_empty() {
            return Err(CompanionError::Upstream(
                "No response from Gemini API".to_string(),
            ));
        }

        let answer = gemini_response.candidates[0]
            .content
            .parts
            .first()
            .ok_or_else(|| CompanionError::Upstream("Empty response from Gemini".to_string()))?
            .text
            .clone();

        let confidence = calculate_confidence(&gemini_response);

        info!("Gemini response received (confidence: {})", confidence);

        Ok((answer, confidence))
    }
}

/// Strip an optional markdown code fence and return the JSON payload.
/// Gemini often wraps JSON-mode answers in ```json fences.
pub fn strip_json_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f32 {
    let base_confidence: f32 = 0.85;

    let finish_confidence = match response.candidates[0].finish_reason.as_deref() {
        Some("STOP") => 1.0,
        Some("LENGTH") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    let response_length = response.candidates[0]
        .content
        .parts
        .first()
        .map(|p| p.text.len())
        .unwrap_or(0);

    let length_confidence = if response_length < 20 {
        0.6
    } else if response_length > 2000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence)
        .min(0.98)
        .max(0.5)
}
