//! Transaction classification
//!
//! Labels a purchase as responsible / neutral / irresponsible / income.
//! The primary classifier is LLM-backed; a deterministic rule-based
//! classifier covers timeouts and malformed responses so transaction
//! creation never fails on classification.

use crate::error::CompanionError;
use crate::gemini::{strip_json_fences, GeminiClient};
use crate::models::Classification;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Reflections are short one-liners shown next to the classification.
pub const MAX_REFLECTION_CHARS: usize = 120;

const DEFAULT_TIMEOUT_MS: u64 = 8_000;

//
// ================= Contract =================
//

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRequest {
    pub merchant: String,
    pub amount: f64,
    pub description: String,
    pub account_balance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub classification: Classification,
    pub reflection: String,
    pub confidence: f32,
    pub reasoning: String,
}

impl ClassifierVerdict {
    /// Enforce the collaborator contract. A verdict that violates it is
    /// treated as an upstream failure and routed to the fallback.
    pub fn validate(self) -> crate::Result<Self> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CompanionError::Upstream(format!(
                "classifier confidence out of range: {}",
                self.confidence
            )));
        }
        if self.reflection.chars().count() > MAX_REFLECTION_CHARS {
            return Err(CompanionError::Upstream(
                "classifier reflection exceeds 120 chars".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Trait for transaction classification (LLM or deterministic)
#[async_trait]
pub trait TransactionClassifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> crate::Result<ClassifierVerdict>;
}

//
// ================= Gemini Classifier =================
//

pub struct GeminiClassifier {
    client: GeminiClient,
}

impl GeminiClassifier {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }

    fn build_prompt(request: &ClassificationRequest) -> String {
        let balance_line = match request.account_balance {
            Some(balance) => format!("Current account balance: {:.2}", balance),
            None => "Current account balance: unknown".to_string(),
        };

        format!(
            r#"Classify this purchase for a personal-finance companion.

Merchant: {}
Amount: {:.2}
Description: {}
{}

Classification values: "responsible", "neutral", "irresponsible", "income".
Use "income" only for credits (salary, refunds, deposits).

Rules:
- Return ONLY valid JSON
- No explanation text outside the JSON
- "reflection" is a supportive one-liner, 120 characters max
- "confidence" is a number between 0 and 1
- JSON format:

{{
  "classification": "responsible",
  "reflection": "...",
  "confidence": 0.9,
  "reasoning": "..."
}}
"#,
            request.merchant, request.amount, request.description, balance_line,
        )
    }
}

const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You are a supportive personal-finance coach.

Guidelines:
- Judge purchases by necessity, size and spending pattern, not morality
- Be encouraging: reflections should never shame the user
- Groceries, rent, utilities and healthcare lean responsible
- Large discretionary or impulse purchases lean irresponsible

Format: respond with a single JSON object and nothing else."#;

#[async_trait]
impl TransactionClassifier for GeminiClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> crate::Result<ClassifierVerdict> {
        let prompt = Self::build_prompt(request);

        let (response, _confidence) = self
            .client
            .generate(CLASSIFIER_SYSTEM_PROMPT, &prompt)
            .await?;

        let verdict: ClassifierVerdict = serde_json::from_str(strip_json_fences(&response))
            .map_err(|e| {
                CompanionError::Upstream(format!(
                    "Failed to parse classifier response: {} | raw={}",
                    e, response
                ))
            })?;

        verdict.validate()
    }
}

//
// ================= Rule-Based Fallback =================
//

/// Static keyword lists, zero allocation
const INCOME_KEYWORDS: &[&str] = &[
    "salary", "payroll", "paycheck", "deposit", "refund", "reimbursement",
    "dividend", "interest payment", "income",
];

const ESSENTIAL_KEYWORDS: &[&str] = &[
    // Household
    "grocery", "groceries", "supermarket", "rent", "mortgage",
    // Utilities & transport
    "utility", "utilities", "electric", "water bill", "internet", "fuel",
    "gas station", "transit", "bus pass",
    // Health
    "pharmacy", "doctor", "dentist", "insurance", "clinic",
];

const INDULGENCE_KEYWORDS: &[&str] = &[
    // Vices
    "casino", "lottery", "betting", "gambling", "cigarette", "vape",
    // Impulse retail
    "designer", "jewelry", "limited edition", "collectible",
    // Nightlife
    "nightclub", "bar tab", "bottle service",
];

/// Spend at or above this is treated as a large discretionary purchase.
const LARGE_AMOUNT: f64 = 300.0;
/// Spend below this is routine.
const ROUTINE_AMOUNT: f64 = 100.0;

/// Deterministic classifier used when the LLM is unavailable.
/// Total function: never errors, never allocates beyond the verdict.
pub struct RuleBasedClassifier;

impl RuleBasedClassifier {
    pub fn evaluate(request: &ClassificationRequest) -> ClassifierVerdict {
        let haystack = format!(
            "{} {}",
            request.merchant.to_lowercase(),
            request.description.to_lowercase()
        );

        let matches_any = |keywords: &[&str]| keywords.iter().any(|kw| haystack.contains(*kw));

        if matches_any(INCOME_KEYWORDS) {
            return verdict(
                Classification::Income,
                "Money in! Every deposit is progress.",
                0.7,
                "Merchant or description matches an income pattern",
            );
        }

        if matches_any(INDULGENCE_KEYWORDS) {
            return verdict(
                Classification::Irresponsible,
                "A treat now and then is fine. Worth a second look, though.",
                0.65,
                "Merchant or description matches an indulgence pattern",
            );
        }

        if matches_any(ESSENTIAL_KEYWORDS) {
            return verdict(
                Classification::Responsible,
                "Covering the essentials. Solid.",
                0.7,
                "Merchant or description matches an essentials pattern",
            );
        }

        // Balance-aware check: a single purchase eating most of the
        // balance is flagged regardless of absolute size.
        if let Some(balance) = request.account_balance {
            if balance > 0.0 && request.amount > balance * 0.5 {
                return verdict(
                    Classification::Irresponsible,
                    "That one takes a big bite out of your balance.",
                    0.6,
                    "Amount exceeds half the available balance",
                );
            }
        }

        if request.amount >= LARGE_AMOUNT {
            verdict(
                Classification::Irresponsible,
                "Big spend. Was it planned? Tell me about it.",
                0.55,
                "Large discretionary amount without an essentials match",
            )
        } else if request.amount >= ROUTINE_AMOUNT {
            verdict(
                Classification::Neutral,
                "Mid-size purchase. Keep an eye on these.",
                0.55,
                "Mid-range amount without a keyword match",
            )
        } else {
            verdict(
                Classification::Responsible,
                "Small and steady. Nothing to worry about.",
                0.6,
                "Routine-size amount without a keyword match",
            )
        }
    }
}

fn verdict(
    classification: Classification,
    reflection: &str,
    confidence: f32,
    reasoning: &str,
) -> ClassifierVerdict {
    ClassifierVerdict {
        classification,
        reflection: reflection.to_string(),
        confidence,
        reasoning: reasoning.to_string(),
    }
}

#[async_trait]
impl TransactionClassifier for RuleBasedClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> crate::Result<ClassifierVerdict> {
        Ok(Self::evaluate(request))
    }
}

//
// ================= Mock Classifier =================
//

/// Fixed-verdict classifier for tests.
pub struct MockClassifier {
    pub verdict: ClassifierVerdict,
}

impl MockClassifier {
    pub fn returning(classification: Classification) -> Self {
        Self {
            verdict: verdict(classification, "mock reflection", 0.9, "mock"),
        }
    }
}

#[async_trait]
impl TransactionClassifier for MockClassifier {
    async fn classify(&self, _request: &ClassificationRequest) -> crate::Result<ClassifierVerdict> {
        Ok(self.verdict.clone())
    }
}

//
// ================= Classification Service =================
//

/// Wraps the primary classifier with a deadline and the deterministic
/// fallback. Classification is a best-effort annotation: this service
/// always produces a verdict.
pub struct ClassificationService {
    primary: Option<Arc<dyn TransactionClassifier>>,
    timeout: Duration,
}

impl ClassificationService {
    pub fn new(primary: Option<Arc<dyn TransactionClassifier>>, timeout: Duration) -> Self {
        Self { primary, timeout }
    }

    /// Build from environment: GEMINI_API_KEY enables the LLM primary,
    /// CLASSIFIER_TIMEOUT_MS overrides the deadline.
    pub fn from_env() -> Self {
        let primary: Option<Arc<dyn TransactionClassifier>> = match env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Some(Arc::new(GeminiClassifier::new(key))),
            _ => None,
        };

        let timeout_ms = env::var("CLASSIFIER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        Self::new(primary, Duration::from_millis(timeout_ms))
    }

    /// Classify with fallback. Never returns an error.
    pub async fn classify(&self, request: &ClassificationRequest) -> ClassifierVerdict {
        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.timeout, primary.classify(request)).await {
                Ok(Ok(verdict)) => return verdict,
                Ok(Err(e)) => {
                    warn!(merchant = %request.merchant, error = %e, "Classifier failed, using rule-based fallback");
                }
                Err(_) => {
                    warn!(merchant = %request.merchant, timeout_ms = self.timeout.as_millis() as u64, "Classifier timed out, using rule-based fallback");
                }
            }
        }

        RuleBasedClassifier::evaluate(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(merchant: &str, amount: f64, description: &str) -> ClassificationRequest {
        ClassificationRequest {
            merchant: merchant.to_string(),
            amount,
            description: description.to_string(),
            account_balance: None,
        }
    }

    #[test]
    fn test_rule_based_income() {
        let verdict = RuleBasedClassifier::evaluate(&request("Acme Corp Payroll", 2500.0, ""));
        assert_eq!(verdict.classification, Classification::Income);
    }

    #[test]
    fn test_rule_based_essentials() {
        let cases = vec![
            ("City Supermarket", 85.0, "weekly groceries"),
            ("Main St Pharmacy", 40.0, "prescription"),
            ("Metro Utilities", 120.0, "electric bill"),
        ];

        for (merchant, amount, description) in cases {
            let verdict = RuleBasedClassifier::evaluate(&request(merchant, amount, description));
            assert_eq!(
                verdict.classification,
                Classification::Responsible,
                "merchant {}",
                merchant
            );
        }
    }

    #[test]
    fn test_rule_based_amount_tiers() {
        assert_eq!(
            RuleBasedClassifier::evaluate(&request("Amazon", 300.0, "")).classification,
            Classification::Irresponsible
        );
        assert_eq!(
            RuleBasedClassifier::evaluate(&request("Amazon", 150.0, "")).classification,
            Classification::Neutral
        );
        assert_eq!(
            RuleBasedClassifier::evaluate(&request("Corner Cafe", 12.0, "")).classification,
            Classification::Responsible
        );
    }

    #[test]
    fn test_rule_based_balance_aware() {
        let mut req = request("Gadget Store", 80.0, "headphones");
        req.account_balance = Some(100.0);

        let verdict = RuleBasedClassifier::evaluate(&req);
        assert_eq!(verdict.classification, Classification::Irresponsible);
    }

    #[test]
    fn test_rule_based_is_deterministic() {
        let req = request("Somewhere", 42.0, "something");
        let first = RuleBasedClassifier::evaluate(&req);
        let second = RuleBasedClassifier::evaluate(&req);
        assert_eq!(first.classification, second.classification);
        assert_eq!(first.reflection, second.reflection);
    }

    #[test]
    fn test_verdict_validation() {
        let bad_confidence = ClassifierVerdict {
            classification: Classification::Responsible,
            reflection: "ok".to_string(),
            confidence: 1.4,
            reasoning: "x".to_string(),
        };
        assert!(bad_confidence.validate().is_err());

        let long_reflection = ClassifierVerdict {
            classification: Classification::Responsible,
            reflection: "x".repeat(MAX_REFLECTION_CHARS + 1),
            confidence: 0.5,
            reasoning: "x".to_string(),
        };
        assert!(long_reflection.validate().is_err());
    }

    struct FailingClassifier;

    #[async_trait]
    impl TransactionClassifier for FailingClassifier {
        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> crate::Result<ClassifierVerdict> {
            Err(CompanionError::Upstream("boom".to_string()))
        }
    }

    struct SleepyClassifier;

    #[async_trait]
    impl TransactionClassifier for SleepyClassifier {
        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> crate::Result<ClassifierVerdict> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("timeout should fire first")
        }
    }

    #[tokio::test]
    async fn test_service_falls_back_on_error() {
        let service = ClassificationService::new(
            Some(Arc::new(FailingClassifier)),
            Duration::from_millis(100),
        );

        let verdict = service.classify(&request("City Supermarket", 50.0, "groceries")).await;
        assert_eq!(verdict.classification, Classification::Responsible);
    }

    #[tokio::test]
    async fn test_service_falls_back_on_timeout() {
        let service = ClassificationService::new(
            Some(Arc::new(SleepyClassifier)),
            Duration::from_millis(20),
        );

        let verdict = service.classify(&request("Amazon", 300.0, "")).await;
        assert_eq!(verdict.classification, Classification::Irresponsible);
    }

    #[tokio::test]
    async fn test_service_without_primary() {
        let service = ClassificationService::new(None, Duration::from_millis(20));
        let verdict = service.classify(&request("Corner Cafe", 8.0, "latte")).await;
        assert_eq!(verdict.classification, Classification::Responsible);
    }
}
