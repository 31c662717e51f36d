//! Weekly budget reconciliation
//!
//! Runs after a successful justification of an irresponsible purchase.
//! If the week's non-income spend already exceeds the weekly budget, the
//! budget is raised to ceil(spend × 1.1); it is never lowered here.

use crate::models::{BudgetAdjustment, Classification, Transaction};
use crate::store::CompanionStore;
use crate::Result;
use chrono::{Datelike, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Headroom applied on top of the observed weekly spend.
const BUDGET_INFLATION: f64 = 1.1;

/// Monday of the calendar week containing `today`.
pub fn week_start(today: NaiveDate) -> NaiveDate {
    today - chrono::Days::new(today.weekday().num_days_from_monday() as u64)
}

/// New budget for a week whose spend exceeded the old one.
pub fn inflation_target(weekly_spend: f64) -> f64 {
    (weekly_spend * BUDGET_INFLATION).ceil()
}

pub struct BudgetReconciler {
    store: Arc<dyn CompanionStore>,
}

impl BudgetReconciler {
    pub fn new(store: Arc<dyn CompanionStore>) -> Self {
        Self { store }
    }

    /// Reconcile the weekly budget after `justified` was accepted.
    /// Only an originally-irresponsible purchase triggers the check;
    /// the store runs the sum-compare-write as one atomic unit per user.
    pub async fn reconcile(
        &self,
        justified: &Transaction,
    ) -> Result<Option<BudgetAdjustment>> {
        if justified.original_classification != Classification::Irresponsible {
            debug!(
                transaction_id = %justified.id,
                original = %justified.original_classification,
                "Skipping budget reconcile: original classification not irresponsible"
            );
            return Ok(None);
        }

        let start = week_start(Utc::now().date_naive());
        let adjustment = self
            .store
            .reconcile_weekly_budget(justified.user_id, start)
            .await?;

        if let Some(adjustment) = &adjustment {
            info!(
                user_id = %justified.user_id,
                previous_budget = adjustment.previous_budget,
                new_budget = adjustment.new_budget,
                weekly_spend = adjustment.weekly_spend,
                "Weekly budget raised after justification"
            );
        }

        Ok(adjustment)
    }
}
