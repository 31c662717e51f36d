//! In-memory store for development and tests
//!
//! Every mutating call takes the single write lock for its whole
//! duration, which gives each trait operation the same atomicity the
//! relational backend gets from transactions and row locks.

use crate::budget::inflation_target;
use crate::models::{
    Account, BadgeUnlockRecord, BudgetAdjustment, Classification, ExperienceEvent,
    LessonReadRecord, ProgressionAccount, Transaction, UserBudgetProfile, XpAward,
};
use crate::progression::level;
use crate::store::{CompanionStore, JustificationResolution};
use crate::error::CompanionError;
use crate::Result;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    transactions: HashMap<Uuid, Transaction>,
    accounts: HashMap<Uuid, Account>,
    budgets: HashMap<Uuid, UserBudgetProfile>,
    progressions: HashMap<Uuid, ProgressionAccount>,
    events: Vec<ExperienceEvent>,
    lessons: HashMap<(Uuid, String), LessonReadRecord>,
    badge_unlocks: HashMap<(Uuid, String), BadgeUnlockRecord>,
}

impl State {
    fn progression_mut(&mut self, user_id: Uuid) -> &mut ProgressionAccount {
        self.progressions
            .entry(user_id)
            .or_insert_with(|| ProgressionAccount::zeroed(user_id))
    }

    /// Shared counter movement for experience appends.
    fn apply_experience(&mut self, event: &ExperienceEvent) -> XpAward {
        let account = self.progression_mut(event.user_id);

        let previous_level = account.current_level;
        account.total_xp += event.amount;
        account.current_xp += event.amount;
        account.current_level = level::level_for_xp(account.total_xp);

        let award = XpAward {
            previous_level,
            new_level: account.current_level,
            leveled_up: account.current_level > previous_level,
            total_xp: account.total_xp,
        };

        self.events.push(event.clone());
        award
    }
}

pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CompanionStore for InMemoryStore {

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;

        let mut transactions: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();

        transactions.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(transactions)
    }

    async fn resolve_justification(
        &self,
        id: Uuid,
        resolution: &JustificationResolution,
    ) -> Result<bool> {
        let mut state = self.state.write().await;

        let Some(transaction) = state.transactions.get_mut(&id) else {
            return Ok(false);
        };

        if transaction.justification_status != crate::models::JustificationStatus::Pending {
            return Ok(false);
        }

        transaction.justification_status = resolution.status;
        transaction.classification = resolution.classification;
        transaction.final_classification = Some(resolution.final_classification);
        transaction.justification = Some(resolution.justification.clone());
        if let Some(reflection) = &resolution.reflection {
            transaction.reflection = reflection.clone();
        }

        Ok(true)
    }

    async fn account_balance(&self, user_id: Uuid) -> Result<Option<f64>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(&user_id).map(|a| a.balance))
    }

    async fn post_to_account(&self, user_id: Uuid, delta: f64) -> Result<f64> {
        let mut state = self.state.write().await;

        let account = state.accounts.entry(user_id).or_insert_with(|| Account {
            user_id,
            balance: 0.0,
            updated_at: Utc::now(),
        });

        account.balance += delta;
        account.updated_at = Utc::now();

        Ok(account.balance)
    }

    async fn weekly_budget(&self, user_id: Uuid) -> Result<Option<f64>> {
        let state = self.state.read().await;
        Ok(state.budgets.get(&user_id).map(|b| b.weekly_budget))
    }

    async fn set_weekly_budget(&self, user_id: Uuid, weekly_budget: f64) -> Result<()> {
        let mut state = self.state.write().await;

        state.budgets.insert(
            user_id,
            UserBudgetProfile {
                user_id,
                weekly_budget,
                updated_at: Utc::now(),
            },
        );

        Ok(())
    }

    async fn reconcile_weekly_budget(
        &self,
        user_id: Uuid,
        week_start: NaiveDate,
    ) -> Result<Option<BudgetAdjustment>> {
        // Single write lock across read-sum-compare-write: concurrent
        // reconciles for the same user serialize here.
        let mut state = self.state.write().await;

        let Some(current_budget) = state.budgets.get(&user_id).map(|b| b.weekly_budget) else {
            return Ok(None);
        };

        let weekly_spend: f64 = state
            .transactions
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.created_at.date_naive() >= week_start
                    && t.effective_classification() != Classification::Income
            })
            .map(|t| t.amount)
            .sum();

        if weekly_spend <= current_budget {
            return Ok(None);
        }

        let new_budget = inflation_target(weekly_spend);
        let Some(profile) = state.budgets.get_mut(&user_id) else {
            return Ok(None);
        };
        profile.weekly_budget = new_budget;
        profile.updated_at = Utc::now();

        Ok(Some(BudgetAdjustment {
            previous_budget: current_budget,
            new_budget,
            weekly_spend,
        }))
    }

    async fn progression(&self, user_id: Uuid) -> Result<ProgressionAccount> {
        let mut state = self.state.write().await;
        Ok(state.progression_mut(user_id).clone())
    }

    async fn append_experience(&self, event: &ExperienceEvent) -> Result<XpAward> {
        let mut state = self.state.write().await;
        Ok(state.apply_experience(event))
    }

    async fn experience_events(&self, user_id: Uuid) -> Result<Vec<ExperienceEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn ensure_lesson_record(
        &self,
        user_id: Uuid,
        lesson_id: &str,
        lesson_title: &str,
    ) -> Result<LessonReadRecord> {
        let mut state = self.state.write().await;

        let record = state
            .lessons
            .entry((user_id, lesson_id.to_string()))
            .or_insert_with(|| LessonReadRecord {
                user_id,
                lesson_id: lesson_id.to_string(),
                lesson_title: lesson_title.to_string(),
                xp_awarded: false,
                created_at: Utc::now(),
            });

        Ok(record.clone())
    }

    async fn grant_lesson_xp(
        &self,
        event: &ExperienceEvent,
        lesson_id: &str,
    ) -> Result<Option<XpAward>> {
        let mut state = self.state.write().await;

        let key = (event.user_id, lesson_id.to_string());
        let Some(record) = state.lessons.get_mut(&key) else {
            return Err(CompanionError::NotFound(format!(
                "Lesson record {} for user {}",
                lesson_id, event.user_id
            )));
        };

        if record.xp_awarded {
            return Ok(None);
        }
        record.xp_awarded = true;

        let award = state.apply_experience(event);
        state.progression_mut(event.user_id).lessons_read += 1;

        Ok(Some(award))
    }

    async fn try_advance_streak(
        &self,
        user_id: Uuid,
        observed: Option<NaiveDate>,
        today: NaiveDate,
        new_streak: i64,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let account = state.progression_mut(user_id);

        if account.last_happiness_check != observed {
            return Ok(false);
        }

        account.consecutive_happy_days = new_streak;
        account.last_happiness_check = Some(today);
        Ok(true)
    }

    async fn overwrite_progression(
        &self,
        user_id: Uuid,
        level_value: i32,
        total_xp: i64,
        current_xp: i64,
    ) -> Result<ProgressionAccount> {
        let mut state = self.state.write().await;
        let account = state.progression_mut(user_id);

        account.current_level = level_value;
        account.total_xp = total_xp;
        account.current_xp = current_xp;

        Ok(account.clone())
    }

    async fn badge_unlocks(&self, user_id: Uuid) -> Result<Vec<BadgeUnlockRecord>> {
        let state = self.state.read().await;
        Ok(state
            .badge_unlocks
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_badge_unlock(&self, user_id: Uuid, badge_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;

        let key = (user_id, badge_id.to_string());
        if state.badge_unlocks.contains_key(&key) {
            return Ok(false);
        }

        state.badge_unlocks.insert(
            key,
            BadgeUnlockRecord {
                user_id,
                badge_id: badge_id.to_string(),
                unlocked_at: Utc::now(),
            },
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExperienceEventType, JustificationStatus};

    fn transaction(user_id: Uuid, amount: f64, classification: Classification) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id,
            amount,
            merchant: "Test Merchant".to_string(),
            category: "misc".to_string(),
            description: String::new(),
            classification,
            original_classification: classification,
            final_classification: None,
            justification_status: if classification.requires_justification() {
                JustificationStatus::Pending
            } else {
                JustificationStatus::None
            },
            justification: None,
            reflection: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn xp_event(user_id: Uuid, amount: i64) -> ExperienceEvent {
        ExperienceEvent {
            id: Uuid::new_v4(),
            user_id,
            event_type: ExperienceEventType::LessonRead,
            amount,
            description: "test".to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_resolve_justification_guard() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let tx = transaction(user_id, 300.0, Classification::Irresponsible);
        store.insert_transaction(&tx).await.unwrap();

        let resolution = JustificationResolution {
            status: JustificationStatus::Justified,
            classification: Classification::Responsible,
            final_classification: Classification::Responsible,
            justification: "needed it".to_string(),
            reflection: None,
        };

        assert!(store.resolve_justification(tx.id, &resolution).await.unwrap());
        // Second attempt loses the guard: the row is terminal now.
        assert!(!store.resolve_justification(tx.id, &resolution).await.unwrap());
        // Unknown id is not an error at this layer.
        assert!(!store
            .resolve_justification(Uuid::new_v4(), &resolution)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_append_experience_moves_counters() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        let award = store.append_experience(&xp_event(user_id, 60)).await.unwrap();
        assert_eq!(award.previous_level, 1);
        assert_eq!(award.new_level, 2);
        assert!(award.leveled_up);

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.total_xp, 60);
        assert_eq!(account.current_xp, 60);
        assert_eq!(account.current_level, 2);

        let events = store.experience_events(user_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_grant_lesson_xp_is_single_shot() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        store
            .ensure_lesson_record(user_id, "lesson-1", "Budgeting 101")
            .await
            .unwrap();

        let first = store
            .grant_lesson_xp(&xp_event(user_id, 25), "lesson-1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .grant_lesson_xp(&xp_event(user_id, 25), "lesson-1")
            .await
            .unwrap();
        assert!(second.is_none());

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.total_xp, 25);
        assert_eq!(account.lessons_read, 1);
    }

    #[tokio::test]
    async fn test_try_advance_streak_conditional() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let today = NaiveDate::from_ymd_opt(2026, 8, 6).unwrap();

        // Guard matches the initial None.
        assert!(store
            .try_advance_streak(user_id, None, today, 1)
            .await
            .unwrap());
        // Stale observation loses.
        assert!(!store
            .try_advance_streak(user_id, None, today, 2)
            .await
            .unwrap());

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.consecutive_happy_days, 1);
        assert_eq!(account.last_happiness_check, Some(today));
    }

    #[tokio::test]
    async fn test_reconcile_weekly_budget() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let week_start = Utc::now().date_naive();

        store.set_weekly_budget(user_id, 850.0).await.unwrap();

        store
            .insert_transaction(&transaction(user_id, 600.0, Classification::Neutral))
            .await
            .unwrap();
        store
            .insert_transaction(&transaction(user_id, 300.0, Classification::Irresponsible))
            .await
            .unwrap();
        // Income is excluded from the weekly sum.
        store
            .insert_transaction(&transaction(user_id, 2_000.0, Classification::Income))
            .await
            .unwrap();

        let adjustment = store
            .reconcile_weekly_budget(user_id, week_start)
            .await
            .unwrap()
            .expect("spend exceeds budget");

        assert_eq!(adjustment.previous_budget, 850.0);
        assert_eq!(adjustment.weekly_spend, 900.0);
        assert_eq!(adjustment.new_budget, 990.0);

        // Second reconcile sees the raised budget and does nothing.
        let again = store
            .reconcile_weekly_budget(user_id, week_start)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_without_profile_is_noop() {
        let store = InMemoryStore::new();
        let adjustment = store
            .reconcile_weekly_budget(Uuid::new_v4(), Utc::now().date_naive())
            .await
            .unwrap();
        assert!(adjustment.is_none());
    }

    #[tokio::test]
    async fn test_badge_unlock_recorded_once() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        assert!(store.record_badge_unlock(user_id, "first_transaction").await.unwrap());
        assert!(!store.record_badge_unlock(user_id, "first_transaction").await.unwrap());

        let unlocks = store.badge_unlocks(user_id).await.unwrap();
        assert_eq!(unlocks.len(), 1);
    }
}
