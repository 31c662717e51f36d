//! Transaction ledger
//!
//! Owns transaction records and the justification state machine:
//! `none` is terminal, `pending` moves to `justified` or `rejected`
//! exactly once. Classification is best-effort (fallback-backed);
//! justification evaluation is not, and leaves the row pending on
//! failure so the submission can be retried.

use crate::budget::BudgetReconciler;
use crate::classifier::{ClassificationRequest, ClassificationService};
use crate::error::CompanionError;
use crate::evaluator::{EvaluationRequest, JustificationEvaluator};
use crate::models::{
    Classification, ExperienceEventType, JustificationOutcome, JustificationStatus,
    NewTransaction, Transaction, TransactionReceipt,
};
use crate::progression::ProgressionLedger;
use crate::store::{CompanionStore, JustificationResolution};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Grant attached to a successfully justified purchase.
const RESPONSIBLE_PURCHASE_XP: i64 = 15;

pub struct TransactionLedger {
    store: Arc<dyn CompanionStore>,
    classifier: ClassificationService,
    evaluator: Arc<dyn JustificationEvaluator>,
    reconciler: BudgetReconciler,
    progression: Arc<ProgressionLedger>,
}

impl TransactionLedger {
    pub fn new(
        store: Arc<dyn CompanionStore>,
        classifier: ClassificationService,
        evaluator: Arc<dyn JustificationEvaluator>,
        reconciler: BudgetReconciler,
        progression: Arc<ProgressionLedger>,
    ) -> Self {
        Self {
            store,
            classifier,
            evaluator,
            reconciler,
            progression,
        }
    }

    /// Create and classify a transaction, then post it to the account.
    pub async fn create_transaction(&self, new: NewTransaction) -> Result<TransactionReceipt> {
        if new.amount <= 0.0 {
            return Err(CompanionError::Validation(format!(
                "Amount must be positive, got {}",
                new.amount
            )));
        }

        let merchant = new.merchant.trim();
        if merchant.is_empty() {
            return Err(CompanionError::Validation(
                "Merchant must not be empty".to_string(),
            ));
        }

        // Balance is classifier context only; a read failure here must
        // not block creation.
        let account_balance = match self.store.account_balance(new.user_id).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(user_id = %new.user_id, error = %e, "Balance read failed during classification");
                None
            }
        };

        let verdict = self
            .classifier
            .classify(&ClassificationRequest {
                merchant: merchant.to_string(),
                amount: new.amount,
                description: new.description.clone(),
                account_balance,
            })
            .await;

        let justification_status = if verdict.classification.requires_justification() {
            JustificationStatus::Pending
        } else {
            JustificationStatus::None
        };

        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            merchant: merchant.to_string(),
            category: new.category,
            description: new.description,
            classification: verdict.classification,
            original_classification: verdict.classification,
            final_classification: Some(verdict.classification),
            justification_status,
            justification: None,
            reflection: verdict.reflection,
            created_at: Utc::now(),
        };

        self.store.insert_transaction(&transaction).await?;

        info!(
            transaction_id = %transaction.id,
            user_id = %transaction.user_id,
            merchant = %transaction.merchant,
            classification = %transaction.classification,
            status = %transaction.justification_status,
            "Transaction created"
        );

        // Income credits the account, spending debits it.
        let delta = if transaction.classification == Classification::Income {
            transaction.amount
        } else {
            -transaction.amount
        };

        match self.store.post_to_account(transaction.user_id, delta).await {
            Ok(balance) => Ok(TransactionReceipt {
                transaction,
                balance_posted: true,
                new_balance: Some(balance),
            }),
            Err(e) => {
                // The transaction exists but the balance does not
                // reflect it; report the partial state, never hide it.
                warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Balance posting failed after transaction insert"
                );
                Ok(TransactionReceipt {
                    transaction,
                    balance_posted: false,
                    new_balance: None,
                })
            }
        }
    }

    /// Submit a justification for a pending transaction.
    pub async fn submit_justification(
        &self,
        transaction_id: Uuid,
        justification_text: &str,
    ) -> Result<JustificationOutcome> {
        let text = justification_text.trim();
        if text.is_empty() {
            return Err(CompanionError::Validation(
                "Justification text must not be empty".to_string(),
            ));
        }

        let transaction = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                CompanionError::NotFound(format!("Transaction {}", transaction_id))
            })?;

        if transaction.justification_status != JustificationStatus::Pending {
            return Err(CompanionError::Conflict(format!(
                "Transaction {} is {}, not pending",
                transaction_id, transaction.justification_status
            )));
        }

        // The evaluator call mutates nothing; an error here leaves the
        // transaction pending and retryable.
        let verdict = self
            .evaluator
            .evaluate(&EvaluationRequest {
                merchant: transaction.merchant.clone(),
                amount: transaction.amount,
                description: transaction.description.clone(),
                justification_text: text.to_string(),
                original_classification: transaction.original_classification,
            })
            .await?;

        let resolution = if verdict.is_valid {
            JustificationResolution {
                status: JustificationStatus::Justified,
                classification: Classification::Responsible,
                final_classification: Classification::Responsible,
                justification: text.to_string(),
                reflection: verdict.new_reflection.clone(),
            }
        } else {
            JustificationResolution {
                status: JustificationStatus::Rejected,
                classification: transaction.classification,
                final_classification: transaction.original_classification,
                justification: text.to_string(),
                reflection: None,
            }
        };

        let applied = self
            .store
            .resolve_justification(transaction_id, &resolution)
            .await?;

        if !applied {
            // Lost the guard to a concurrent submission.
            return Err(CompanionError::Conflict(format!(
                "Transaction {} was resolved concurrently",
                transaction_id
            )));
        }

        let mut updated = transaction.clone();
        updated.justification_status = resolution.status;
        updated.classification = resolution.classification;
        updated.final_classification = Some(resolution.final_classification);
        updated.justification = Some(resolution.justification.clone());
        if let Some(reflection) = &resolution.reflection {
            updated.reflection = reflection.clone();
        }

        info!(
            transaction_id = %transaction_id,
            accepted = verdict.is_valid,
            "Justification resolved"
        );

        if !verdict.is_valid {
            return Ok(JustificationOutcome {
                transaction: updated,
                accepted: false,
                reasoning: verdict.reasoning,
                budget_adjustment: None,
                xp_awarded: false,
            });
        }

        // Side effects of acceptance. Neither may undo the terminal
        // transition: failures are reported, not rolled back.
        let budget_adjustment = match self.reconciler.reconcile(&updated).await {
            Ok(adjustment) => adjustment,
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "Budget reconcile failed");
                None
            }
        };

        let xp_awarded = match self
            .progression
            .award_xp(
                updated.user_id,
                ExperienceEventType::ResponsiblePurchase,
                RESPONSIBLE_PURCHASE_XP,
                &format!("Justified purchase at {}", updated.merchant),
                serde_json::json!({ "transaction_id": updated.id }),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "Responsible purchase grant failed");
                false
            }
        };

        Ok(JustificationOutcome {
            transaction: updated,
            accepted: true,
            reasoning: verdict.reasoning,
            budget_adjustment,
            xp_awarded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MockClassifier;
    use crate::error::ErrorKind;
    use crate::evaluator::{FailingEvaluator, MockEvaluator};
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn ledger_with(
        classification: Classification,
        evaluator: Arc<dyn JustificationEvaluator>,
    ) -> (TransactionLedger, Arc<InMemoryStore>) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let classifier = ClassificationService::new(
            Some(Arc::new(MockClassifier::returning(classification))),
            Duration::from_millis(100),
        );
        let progression = Arc::new(ProgressionLedger::new(store.clone()));
        let ledger = TransactionLedger::new(
            store.clone(),
            classifier,
            evaluator,
            BudgetReconciler::new(store.clone()),
            progression,
        );
        (ledger, store)
    }

    fn new_transaction(user_id: Uuid, merchant: &str, amount: f64) -> NewTransaction {
        NewTransaction {
            user_id,
            merchant: merchant.to_string(),
            amount,
            category: "shopping".to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (ledger, _) = ledger_with(
            Classification::Responsible,
            Arc::new(MockEvaluator::accepting()),
        );
        let user_id = Uuid::new_v4();

        let zero = ledger
            .create_transaction(new_transaction(user_id, "Shop", 0.0))
            .await;
        assert!(matches!(zero, Err(CompanionError::Validation(_))));

        let negative = ledger
            .create_transaction(new_transaction(user_id, "Shop", -5.0))
            .await;
        assert!(matches!(negative, Err(CompanionError::Validation(_))));

        let empty_merchant = ledger
            .create_transaction(new_transaction(user_id, "   ", 10.0))
            .await;
        assert!(matches!(empty_merchant, Err(CompanionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unfavorable_classification_enters_pending() {
        let (ledger, _) = ledger_with(
            Classification::Irresponsible,
            Arc::new(MockEvaluator::accepting()),
        );

        let receipt = ledger
            .create_transaction(new_transaction(Uuid::new_v4(), "Amazon", 300.0))
            .await
            .unwrap();

        let t = &receipt.transaction;
        assert_eq!(t.justification_status, JustificationStatus::Pending);
        assert_eq!(t.classification, Classification::Irresponsible);
        assert_eq!(t.original_classification, Classification::Irresponsible);
    }

    #[tokio::test]
    async fn test_favorable_classification_is_terminal_none() {
        let (ledger, _) = ledger_with(
            Classification::Responsible,
            Arc::new(MockEvaluator::accepting()),
        );

        let receipt = ledger
            .create_transaction(new_transaction(Uuid::new_v4(), "Supermarket", 40.0))
            .await
            .unwrap();

        assert_eq!(
            receipt.transaction.justification_status,
            JustificationStatus::None
        );

        // `none` is terminal: never justifiable.
        let result = ledger
            .submit_justification(receipt.transaction.id, "it was needed")
            .await;
        assert!(matches!(result, Err(CompanionError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_balance_posting() {
        let (ledger, store) = ledger_with(
            Classification::Responsible,
            Arc::new(MockEvaluator::accepting()),
        );
        let user_id = Uuid::new_v4();

        let receipt = ledger
            .create_transaction(new_transaction(user_id, "Supermarket", 40.0))
            .await
            .unwrap();
        assert!(receipt.balance_posted);
        assert_eq!(receipt.new_balance, Some(-40.0));
        assert_eq!(store.account_balance(user_id).await.unwrap(), Some(-40.0));
    }

    #[tokio::test]
    async fn test_income_credits_balance() {
        let (ledger, store) = ledger_with(
            Classification::Income,
            Arc::new(MockEvaluator::accepting()),
        );
        let user_id = Uuid::new_v4();

        ledger
            .create_transaction(new_transaction(user_id, "Acme Payroll", 2_500.0))
            .await
            .unwrap();
        assert_eq!(store.account_balance(user_id).await.unwrap(), Some(2_500.0));
    }

    #[tokio::test]
    async fn test_justification_accepted_reclassifies_and_raises_budget() {
        let (ledger, store) = ledger_with(
            Classification::Irresponsible,
            Arc::new(MockEvaluator::accepting()),
        );
        let user_id = Uuid::new_v4();

        store.set_weekly_budget(user_id, 850.0).await.unwrap();

        // 600 of other spend already this week.
        ledger
            .create_transaction(new_transaction(user_id, "Electronics", 600.0))
            .await
            .unwrap();

        let receipt = ledger
            .create_transaction(new_transaction(user_id, "Amazon", 300.0))
            .await
            .unwrap();

        let outcome = ledger
            .submit_justification(receipt.transaction.id, "Planned purchase for work")
            .await
            .unwrap();

        assert!(outcome.accepted);
        let t = &outcome.transaction;
        assert_eq!(t.justification_status, JustificationStatus::Justified);
        assert_eq!(t.final_classification, Some(Classification::Responsible));
        assert_eq!(t.classification, Classification::Responsible);

        // Weekly spend 900 > budget 850: raised to ceil(900 * 1.1).
        let adjustment = outcome.budget_adjustment.expect("budget raised");
        assert_eq!(adjustment.new_budget, 990.0);
        assert_eq!(store.weekly_budget(user_id).await.unwrap(), Some(990.0));

        // Acceptance grants the responsible-purchase XP.
        assert!(outcome.xp_awarded);
        let progression = store.progression(user_id).await.unwrap();
        assert_eq!(progression.total_xp, 15);
    }

    #[tokio::test]
    async fn test_justification_rejected_keeps_original() {
        let (ledger, store) = ledger_with(
            Classification::Irresponsible,
            Arc::new(MockEvaluator::rejecting()),
        );
        let user_id = Uuid::new_v4();

        store.set_weekly_budget(user_id, 850.0).await.unwrap();

        let receipt = ledger
            .create_transaction(new_transaction(user_id, "Amazon", 300.0))
            .await
            .unwrap();

        let outcome = ledger
            .submit_justification(receipt.transaction.id, "I wanted it")
            .await
            .unwrap();

        assert!(!outcome.accepted);
        let t = &outcome.transaction;
        assert_eq!(t.justification_status, JustificationStatus::Rejected);
        assert_eq!(t.final_classification, Some(Classification::Irresponsible));
        assert!(outcome.budget_adjustment.is_none());
        assert_eq!(store.weekly_budget(user_id).await.unwrap(), Some(850.0));

        // Rejected is terminal.
        let again = ledger
            .submit_justification(receipt.transaction.id, "second try")
            .await;
        assert!(matches!(again, Err(CompanionError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let (ledger, _) = ledger_with(
            Classification::Irresponsible,
            Arc::new(MockEvaluator::accepting()),
        );

        let result = ledger
            .submit_justification(Uuid::new_v4(), "anything")
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_evaluator_failure_leaves_pending() {
        let (ledger, store) = ledger_with(
            Classification::Irresponsible,
            Arc::new(FailingEvaluator),
        );

        let receipt = ledger
            .create_transaction(new_transaction(Uuid::new_v4(), "Amazon", 300.0))
            .await
            .unwrap();

        let result = ledger
            .submit_justification(receipt.transaction.id, "planned purchase")
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Upstream);

        // No state was mutated: the submission can be retried.
        let stored = store
            .transaction(receipt.transaction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.justification_status, JustificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_empty_justification_rejected_upfront() {
        let (ledger, _) = ledger_with(
            Classification::Irresponsible,
            Arc::new(MockEvaluator::accepting()),
        );

        let result = ledger.submit_justification(Uuid::new_v4(), "   ").await;
        assert!(matches!(result, Err(CompanionError::Validation(_))));
    }
}
