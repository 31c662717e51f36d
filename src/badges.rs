//! Badge engine
//!
//! Badges are pure derivations over current transaction/account/
//! progression state. The unlock record, not the live metric, is
//! authoritative for "earned": once recorded, a badge stays earned even
//! if the underlying metric later regresses. Recording is
//! insert-or-detect, so the newly-earned signal fires at most once.

use crate::models::{BadgeStatus, Classification, ProgressionAccount, Transaction};
use crate::store::CompanionStore;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Aggregates a predicate may inspect. Predicates must be
/// deterministic functions of this context alone.
pub struct BadgeContext<'a> {
    pub transactions: &'a [Transaction],
    pub balance: f64,
    pub progression: &'a ProgressionAccount,
}

/// Trait for a single badge predicate
pub trait BadgePredicate: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn earned(&self, context: &BadgeContext) -> bool;
}

//
// ================= Built-in Predicates =================
//

/// At least one tracked transaction.
pub struct FirstTransaction;

impl BadgePredicate for FirstTransaction {
    fn id(&self) -> &'static str {
        "first_transaction"
    }

    fn name(&self) -> &'static str {
        "First Steps"
    }

    fn description(&self) -> &'static str {
        "Track your first transaction"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        !context.transactions.is_empty()
    }
}

/// Five or more coffee-category purchases.
pub struct CoffeeConnoisseur;

impl BadgePredicate for CoffeeConnoisseur {
    fn id(&self) -> &'static str {
        "coffee_connoisseur"
    }

    fn name(&self) -> &'static str {
        "Coffee Connoisseur"
    }

    fn description(&self) -> &'static str {
        "Log five coffee purchases"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        context
            .transactions
            .iter()
            .filter(|t| t.category.to_lowercase().contains("coffee"))
            .count()
            >= 5
    }
}

/// Ten or more responsibly-classified purchases.
pub struct ResponsibleSpender;

impl BadgePredicate for ResponsibleSpender {
    fn id(&self) -> &'static str {
        "responsible_spender"
    }

    fn name(&self) -> &'static str {
        "Responsible Spender"
    }

    fn description(&self) -> &'static str {
        "Make ten responsible purchases"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        context
            .transactions
            .iter()
            .filter(|t| t.effective_classification() == Classification::Responsible)
            .count()
            >= 10
    }
}

/// Account balance at or above the savings threshold.
pub struct BalanceBuilder;

const BALANCE_THRESHOLD: f64 = 1_000.0;

impl BadgePredicate for BalanceBuilder {
    fn id(&self) -> &'static str {
        "balance_builder"
    }

    fn name(&self) -> &'static str {
        "Balance Builder"
    }

    fn description(&self) -> &'static str {
        "Grow your balance to 1,000"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        context.balance >= BALANCE_THRESHOLD
    }
}

/// Twenty-five or more tracked transactions.
pub struct DedicatedTracker;

impl BadgePredicate for DedicatedTracker {
    fn id(&self) -> &'static str {
        "dedicated_tracker"
    }

    fn name(&self) -> &'static str {
        "Dedicated Tracker"
    }

    fn description(&self) -> &'static str {
        "Track twenty-five transactions"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        context.transactions.len() >= 25
    }
}

/// A full week of consecutive happy days.
pub struct StreakKeeper;

impl BadgePredicate for StreakKeeper {
    fn id(&self) -> &'static str {
        "streak_keeper"
    }

    fn name(&self) -> &'static str {
        "Streak Keeper"
    }

    fn description(&self) -> &'static str {
        "Hold a seven-day happiness streak"
    }

    fn earned(&self, context: &BadgeContext) -> bool {
        context.progression.consecutive_happy_days >= 7
    }
}

//
// ================= Engine =================
//

pub struct BadgeEngine {
    store: Arc<dyn CompanionStore>,
    predicates: Vec<Box<dyn BadgePredicate>>,
}

impl BadgeEngine {
    pub fn new(store: Arc<dyn CompanionStore>) -> Self {
        Self {
            store,
            predicates: Vec::new(),
        }
    }

    pub fn add_predicate(&mut self, predicate: Box<dyn BadgePredicate>) {
        self.predicates.push(predicate);
    }

    /// Evaluate every predicate against current aggregates. Creates
    /// unlock records for predicates that are newly true; never mutates
    /// ledger state otherwise.
    pub async fn evaluate(&self, user_id: Uuid) -> Result<Vec<BadgeStatus>> {
        let transactions = self.store.transactions_for_user(user_id).await?;
        let balance = self.store.account_balance(user_id).await?.unwrap_or(0.0);
        let progression = self.store.progression(user_id).await?;

        let recorded: HashSet<String> = self
            .store
            .badge_unlocks(user_id)
            .await?
            .into_iter()
            .map(|r| r.badge_id)
            .collect();

        let context = BadgeContext {
            transactions: &transactions,
            balance,
            progression: &progression,
        };

        let mut statuses = Vec::with_capacity(self.predicates.len());

        for predicate in &self.predicates {
            let currently_true = predicate.earned(&context);
            let already_recorded = recorded.contains(predicate.id());

            // The insert-or-detect result decides "newly earned", so a
            // racing evaluation cannot double-notify.
            let newly_earned = if currently_true && !already_recorded {
                self.store.record_badge_unlock(user_id, predicate.id()).await?
            } else {
                false
            };

            if newly_earned {
                info!(user_id = %user_id, badge_id = predicate.id(), "Badge unlocked");
            }

            statuses.push(BadgeStatus {
                badge_id: predicate.id().to_string(),
                name: predicate.name().to_string(),
                description: predicate.description().to_string(),
                earned: already_recorded || currently_true,
                newly_earned,
            });
        }

        Ok(statuses)
    }
}

/// Create a badge engine with the standard predicate set
pub fn create_default_badge_engine(store: Arc<dyn CompanionStore>) -> BadgeEngine {
    let mut engine = BadgeEngine::new(store);
    engine.add_predicate(Box::new(FirstTransaction));
    engine.add_predicate(Box::new(CoffeeConnoisseur));
    engine.add_predicate(Box::new(ResponsibleSpender));
    engine.add_predicate(Box::new(BalanceBuilder));
    engine.add_predicate(Box::new(DedicatedTracker));
    engine.add_predicate(Box::new(StreakKeeper));
    engine
}

//
// ================= Tests =================
//
