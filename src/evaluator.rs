//! Justification evaluation
//!
//! Judges the user's free-text defense of an unfavorably classified
//! purchase. Unlike classification there is no deterministic fallback:
//! an evaluator failure leaves the transaction pending and is surfaced
//! to the caller as retryable.

use crate::error::CompanionError;
use crate::gemini::{strip_json_fences, GeminiClient};
use crate::models::Classification;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::info;

const DEFAULT_TIMEOUT_MS: u64 = 8_000;

//
// ================= Contract =================
//

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub merchant: String,
    pub amount: f64,
    pub description: String,
    pub justification_text: String,
    pub original_classification: Classification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    pub is_valid: bool,
    pub reasoning: String,
    #[serde(default)]
    pub new_reflection: Option<String>,
}

/// Trait for justification evaluation
#[async_trait]
pub trait JustificationEvaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> crate::Result<EvaluatorVerdict>;
}

//
// ================= Gemini Evaluator =================
//

pub struct GeminiEvaluator {
    client: GeminiClient,
    timeout: Duration,
}

impl GeminiEvaluator {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Build from environment. Returns None without an API key so the
    /// caller can refuse justification submissions cleanly.
    pub fn from_env() -> Option<Self> {
        let key = env::var("GEMINI_API_KEY").ok()?;
        if key.trim().is_empty() {
            return None;
        }

        let timeout_ms = env::var("EVALUATOR_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        Some(Self {
            client: GeminiClient::new(key),
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn build_prompt(request: &EvaluationRequest) -> String {
        format!(
            r#"A user is contesting how one of their purchases was classified.

Merchant: {}
Amount: {:.2}
Description: {}
Original classification: {}

Their justification:
"{}"

Decide whether the justification genuinely explains the purchase as a
reasonable, considered decision (true) or not (false).

Rules:
- Return ONLY valid JSON
- "new_reflection" is optional: a supportive one-liner (120 chars max)
  to replace the old narrative when the justification is accepted
- JSON format:

{{
  "is_valid": true,
  "reasoning": "...",
  "new_reflection": "..."
}}
"#,
            request.merchant,
            request.amount,
            request.description,
            request.original_classification,
            request.justification_text,
        )
    }
}

const EVALUATOR_SYSTEM_PROMPT: &str = r#"You are a fair but rigorous spending reviewer.

Guidelines:
- Accept justifications that show planning, necessity or a considered trade-off
- Reject justifications that merely restate the desire to buy
- Never punish honesty; judge the reasoning, not the wording

Format: respond with a single JSON object and nothing else."#;

#[async_trait]
impl JustificationEvaluator for GeminiEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> crate::Result<EvaluatorVerdict> {
        let prompt = Self::build_prompt(request);

        let generated = tokio::time::timeout(
            self.timeout,
            self.client.generate(EVALUATOR_SYSTEM_PROMPT, &prompt),
        )
        .await
        .map_err(|_| {
            CompanionError::Upstream(format!(
                "Justification evaluator timed out after {} ms",
                self.timeout.as_millis()
            ))
        })?;

        let (response, _confidence) = generated?;

        let verdict: EvaluatorVerdict = serde_json::from_str(strip_json_fences(&response))
            .map_err(|e| {
                CompanionError::Upstream(format!(
                    "Failed to parse evaluator response: {} | raw={}",
                    e, response
                ))
            })?;

        info!(is_valid = verdict.is_valid, "Justification evaluated");

        Ok(verdict)
    }
}

//
// ================= Mock Evaluator =================
//

/// Deterministic evaluator for development & testing.
/// Accepts any justification with some substance to it.
pub struct MockEvaluator {
    pub accept: bool,
}

impl MockEvaluator {
    pub fn accepting() -> Self {
        Self { accept: true }
    }

    pub fn rejecting() -> Self {
        Self { accept: false }
    }
}

#[async_trait]
impl JustificationEvaluator for MockEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> crate::Result<EvaluatorVerdict> {
        if self.accept {
            Ok(EvaluatorVerdict {
                is_valid: true,
                reasoning: format!(
                    "Justification for {} accepted by mock evaluator",
                    request.merchant
                ),
                new_reflection: Some("Good call taking the time to explain this one.".to_string()),
            })
        } else {
            Ok(EvaluatorVerdict {
                is_valid: false,
                reasoning: "Justification rejected by mock evaluator".to_string(),
                new_reflection: None,
            })
        }
    }
}

/// Evaluator that always errors; used to exercise the retryable path.
pub struct FailingEvaluator;

#[async_trait]
impl JustificationEvaluator for FailingEvaluator {
    async fn evaluate(&self, _request: &EvaluationRequest) -> crate::Result<EvaluatorVerdict> {
        Err(CompanionError::Upstream(
            "evaluator unavailable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> EvaluationRequest {
        EvaluationRequest {
            merchant: "Amazon".to_string(),
            amount: 300.0,
            description: "standing desk".to_string(),
            justification_text: text.to_string(),
            original_classification: Classification::Irresponsible,
        }
    }

    #[tokio::test]
    async fn test_mock_accepts() {
        let verdict = MockEvaluator::accepting()
            .evaluate(&request("I work from home and my back hurts"))
            .await
            .unwrap();
        assert!(verdict.is_valid);
        assert!(verdict.new_reflection.is_some());
    }

    #[tokio::test]
    async fn test_mock_rejects() {
        let verdict = MockEvaluator::rejecting()
            .evaluate(&request("I wanted it"))
            .await
            .unwrap();
        assert!(!verdict.is_valid);
        assert!(verdict.new_reflection.is_none());
    }

    #[test]
    fn test_verdict_parses_without_reflection() {
        let verdict: EvaluatorVerdict =
            serde_json::from_str(r#"{"is_valid": false, "reasoning": "restates desire"}"#)
                .unwrap();
        assert!(!verdict.is_valid);
        assert!(verdict.new_reflection.is_none());
    }
}
