//! Finance Companion Core
//!
//! A personal-finance companion backend that:
//! - Classifies spending (LLM-backed with a deterministic fallback)
//! - Lets the user contest unfavorable classifications
//! - Reconciles the weekly budget after accepted justifications
//! - Rewards engagement through an experience ledger, levels,
//!   happiness streaks and badges
//!
//! FLOW:
//! CREATE → CLASSIFY → (PENDING?) → JUSTIFY → RECLASSIFY → RECONCILE
//! with lesson reads, mood checks and badge evaluation feeding the
//! progression ledger independently, each gated for idempotence.

pub mod api;
pub mod badges;
pub mod budget;
pub mod classifier;
pub mod error;
pub mod evaluator;
pub mod gemini;
pub mod ledger;
pub mod models;
pub mod progression;
pub mod store;
pub mod streak;

pub use error::{CompanionError, ErrorKind, Result};

// Re-export common types
pub use models::*;
pub use classifier::{ClassificationService, RuleBasedClassifier, TransactionClassifier};
pub use evaluator::JustificationEvaluator;
